//! Concrete [`ProtocolHandler`] binding for the eSCL family (§4.8).

use std::time::Duration;

use anyhow::{bail, Context};
use itertools::Itertools;
use quick_xml::events::Event;
use quick_xml::reader::Reader;

use crate::device::options::{AxisCaps, Capabilities};
use crate::error::Status;

use super::{
    decode_cancel_or_cleanup, DecodeResult, HttpReply, HttpRequest, Method, NextOp, Operation,
    Payload, ProtocolContext, ProtocolHandler,
};

/// eSCL protocol handler. Stateless; all per-device state lives in the
/// [`ProtocolContext`] passed to each call.
#[derive(Default)]
pub struct EsclHandler;

impl ProtocolHandler for EsclHandler {
    fn normalize_uri(&self, uri: &str) -> String {
        if uri.ends_with('/') {
            uri.to_string()
        } else {
            format!("{uri}/")
        }
    }

    fn build_query(&self, op: Operation, ctx: &ProtocolContext) -> HttpRequest {
        match op {
            Operation::Caps => HttpRequest {
                method: Method::Get,
                url: format!("{}ScannerCapabilities", ctx.base_uri),
                body: None,
                content_type: None,
            },
            Operation::Scan => HttpRequest {
                method: Method::Post,
                url: format!("{}ScanJobs", ctx.base_uri),
                body: Some(scan_settings_xml(ctx).into_bytes()),
                content_type: Some("application/xml".to_string()),
            },
            Operation::Load => HttpRequest {
                method: Method::Get,
                url: format!("{}/NextDocument", ctx.job_uri.unwrap_or_default()),
                body: None,
                content_type: None,
            },
            Operation::Status => HttpRequest {
                method: Method::Get,
                url: format!("{}/ScannerStatus", ctx.job_uri.unwrap_or(ctx.base_uri)),
                body: None,
                content_type: None,
            },
            Operation::Cancel | Operation::Cleanup => HttpRequest {
                method: Method::Delete,
                url: ctx.job_uri.unwrap_or(ctx.base_uri).to_string(),
                body: None,
                content_type: None,
            },
        }
    }

    fn decode_reply(&self, op: Operation, reply: &HttpReply, ctx: &ProtocolContext) -> DecodeResult {
        if reply.status_code == 503 {
            return retry_or_give_up(op, ctx);
        }

        match op {
            Operation::Caps => unreachable!("Caps replies go through decode_caps"),
            Operation::Scan => decode_scan(reply, op, ctx),
            Operation::Load => decode_load(reply, op, ctx),
            Operation::Status => decode_status(reply, op, ctx),
            Operation::Cancel | Operation::Cleanup => decode_cancel_or_cleanup(reply),
        }
    }

    fn decode_caps(&self, reply: &HttpReply) -> anyhow::Result<Capabilities> {
        if reply.status_code != 200 {
            bail!("ScannerCapabilities request failed with HTTP {}", reply.status_code);
        }
        parse_capabilities_xml(&reply.body)
    }
}

fn retry_or_give_up(op: Operation, ctx: &ProtocolContext) -> DecodeResult {
    if ctx.retry_attempt < ctx.retry_max_attempts {
        DecodeResult::retry_after(op, ctx.retry_interval)
    } else {
        DecodeResult::finish(Status::IoError)
    }
}

fn decode_scan(reply: &HttpReply, op: Operation, ctx: &ProtocolContext) -> DecodeResult {
    if reply.status_code != 201 {
        return retry_or_give_up_or_finish(op, ctx, reply.status_code);
    }
    let job_uri = match reply.header("Location") {
        Some(uri) => uri.to_string(),
        None => return DecodeResult::finish(Status::IoError),
    };
    DecodeResult {
        next: NextOp::Again(Operation::Load),
        delay: Duration::ZERO,
        status: Status::Good,
        payload: Some(Payload::JobUri(job_uri)),
    }
}

fn decode_load(reply: &HttpReply, op: Operation, ctx: &ProtocolContext) -> DecodeResult {
    match reply.status_code {
        200 => {
            let content_type = reply.header("Content-Type").unwrap_or("image/jpeg").to_string();
            DecodeResult {
                next: NextOp::Again(Operation::Load),
                delay: Duration::ZERO,
                status: Status::Good,
                payload: Some(Payload::Image { bytes: reply.body.clone(), content_type }),
            }
        }
        404 => DecodeResult::finish(Status::Good),
        // Some scanners answer NextDocument with 409 while the feeder is
        // jammed or a cover is open instead of failing the page outright.
        // Poll ScannerStatus rather than guessing; decode_status resolves
        // it back to LOAD, a retry delay, or a hard finish.
        409 => DecodeResult::again(Operation::Status, Status::Good),
        _ => retry_or_give_up_or_finish(op, ctx, reply.status_code),
    }
}

fn decode_status(reply: &HttpReply, op: Operation, ctx: &ProtocolContext) -> DecodeResult {
    let state = String::from_utf8_lossy(&reply.body);
    if state.contains("Idle") || state.contains("Processing") {
        DecodeResult::again(Operation::Load, Status::Good)
    } else if state.contains("Jamming") {
        retry_or_give_up(op, ctx)
    } else {
        DecodeResult::finish(Status::IoError)
    }
}

fn retry_or_give_up_or_finish(op: Operation, ctx: &ProtocolContext, status_code: u16) -> DecodeResult {
    if (500..600).contains(&status_code) {
        retry_or_give_up(op, ctx)
    } else {
        DecodeResult::finish(Status::IoError)
    }
}

fn scan_settings_xml(ctx: &ProtocolContext) -> String {
    let opts = ctx.options;
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<scan:ScanSettings xmlns:scan="http://schemas.hp.com/imaging/escl/2011/05/03" xmlns:pwg="http://www.pwg.org/schemas/2010/12/sm">
  <pwg:Version>2.0</pwg:Version>
  <pwg:ScanRegions>
    <pwg:ScanRegion>
      <pwg:XOffset>{x_off}</pwg:XOffset>
      <pwg:YOffset>{y_off}</pwg:YOffset>
      <pwg:Width>{width}</pwg:Width>
      <pwg:Height>{height}</pwg:Height>
      <pwg:ContentRegionUnits>escl:ThreeHundredthsOfInches</pwg:ContentRegionUnits>
    </pwg:ScanRegion>
  </pwg:ScanRegions>
  <pwg:InputSource>{source}</pwg:InputSource>
  <scan:ColorMode>{color_mode}</scan:ColorMode>
  <scan:XResolution>{resolution}</scan:XResolution>
  <scan:YResolution>{resolution}</scan:YResolution>
</scan:ScanSettings>"#,
        x_off = opts.skip_x.off,
        y_off = opts.skip_y.off,
        width = opts.skip_x.len,
        height = opts.skip_y.len,
        source = opts.source,
        color_mode = opts.color_mode,
        resolution = opts.resolution,
    )
}

/// Parse the (reduced) subset of `ScannerCapabilities` this core needs:
/// reference DPI, the platen's min/max width and height, supported
/// resolutions, sources and color modes.
fn parse_capabilities_xml(body: &[u8]) -> anyhow::Result<Capabilities> {
    let mut reader = Reader::from_reader(body);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut path: Vec<String> = Vec::new();

    let mut units: u32 = 300;
    let mut min_width = 1u32;
    let mut max_width = 2550u32;
    let mut min_height = 1u32;
    let mut max_height = 3300u32;
    let mut resolutions = Vec::new();
    let mut sources = Vec::new();
    let mut color_modes = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).context("parsing ScannerCapabilities XML")? {
            Event::Start(e) => path.push(local_name(&e.name().as_ref().to_vec())),
            Event::Empty(e) => {
                // Self-closing tags carry no text; nothing to record.
                let _ = local_name(&e.name().as_ref().to_vec());
            }
            Event::End(_) => { path.pop(); }
            Event::Text(t) => {
                let text = t.unescape().unwrap_or_default().trim().to_string();
                if text.is_empty() {
                    continue;
                }
                match path.last().map(String::as_str) {
                    Some("MinWidth") => min_width = text.parse().unwrap_or(min_width),
                    Some("MaxWidth") => max_width = text.parse().unwrap_or(max_width),
                    Some("MinHeight") => min_height = text.parse().unwrap_or(min_height),
                    Some("MaxHeight") => max_height = text.parse().unwrap_or(max_height),
                    Some("XResolution") => {
                        if let Ok(v) = text.parse::<u32>() {
                            resolutions.push(v);
                        }
                    }
                    Some("InputSource") if path.iter().any(|p| p == "SupportedInputSource" || p == "InputSource") => {
                        sources.push(text);
                    }
                    Some("ColorMode") => {
                        color_modes.push(text);
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    // Each setting profile repeats its resolutions/sources/color modes;
    // fold the duplicates away while keeping first-seen order.
    let mut resolutions: Vec<u32> = resolutions.into_iter().unique().collect();
    let mut sources: Vec<String> = sources.into_iter().unique().collect();
    let mut color_modes: Vec<String> = color_modes.into_iter().unique().collect();

    if resolutions.is_empty() {
        resolutions.push(units);
    }
    if sources.is_empty() {
        sources.push("Platen".to_string());
    }
    if color_modes.is_empty() {
        color_modes.push("RGB24".to_string());
    }
    // eSCL expresses widths in three-hundredths of an inch; our reference
    // DPI matches that unit scale directly.
    units = 300;

    Ok(Capabilities {
        units,
        x: AxisCaps { min_len: min_width, max_len: max_width },
        y: AxisCaps { min_len: min_height, max_len: max_height },
        resolutions,
        sources,
        color_modes,
    })
}

fn local_name(qname: &[u8]) -> String {
    let s = String::from_utf8_lossy(qname);
    s.rsplit(':').next().unwrap_or(&s).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE_CAPS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<scan:ScannerCapabilities xmlns:scan="http://schemas.hp.com/imaging/escl/2011/05/03" xmlns:pwg="http://www.pwg.org/schemas/2010/12/sm">
  <pwg:Version>2.0</pwg:Version>
  <scan:Platen>
    <scan:PlatenInputCaps>
      <scan:MinWidth>16</scan:MinWidth>
      <scan:MaxWidth>2550</scan:MaxWidth>
      <scan:MinHeight>16</scan:MinHeight>
      <scan:MaxHeight>3508</scan:MaxHeight>
      <scan:SettingProfiles>
        <scan:SettingProfile>
          <scan:ColorModes>
            <scan:ColorMode>RGB24</scan:ColorMode>
            <scan:ColorMode>Grayscale8</scan:ColorMode>
          </scan:ColorModes>
          <scan:SupportedResolutions>
            <scan:DiscreteResolution>
              <scan:XResolution>300</scan:XResolution>
              <scan:YResolution>300</scan:YResolution>
            </scan:DiscreteResolution>
            <scan:DiscreteResolution>
              <scan:XResolution>600</scan:XResolution>
              <scan:YResolution>600</scan:YResolution>
            </scan:DiscreteResolution>
          </scan:SupportedResolutions>
        </scan:SettingProfile>
      </scan:SettingProfiles>
    </scan:PlatenInputCaps>
  </scan:Platen>
</scan:ScannerCapabilities>"#;

    #[test]
    fn parses_sample_capabilities() {
        let caps = parse_capabilities_xml(SAMPLE_CAPS.as_bytes()).unwrap();
        assert_eq!(caps.x, AxisCaps { min_len: 16, max_len: 2550 });
        assert_eq!(caps.y, AxisCaps { min_len: 16, max_len: 3508 });
        assert_eq!(caps.resolutions, vec![300, 600]);
        assert_eq!(caps.color_modes, vec!["RGB24".to_string(), "Grayscale8".to_string()]);
    }

    #[test]
    fn normalizes_trailing_slash() {
        let handler = EsclHandler;
        assert_eq!(handler.normalize_uri("http://printer.local/eSCL"), "http://printer.local/eSCL/");
        assert_eq!(handler.normalize_uri("http://printer.local/eSCL/"), "http://printer.local/eSCL/");
    }

    #[test]
    fn scan_success_carries_job_uri_and_advances_to_load() {
        let caps = Capabilities {
            units: 300,
            x: AxisCaps { min_len: 1, max_len: 2550 },
            y: AxisCaps { min_len: 1, max_len: 3300 },
            resolutions: vec![300],
            sources: vec!["Platen".to_string()],
            color_modes: vec!["RGB24".to_string()],
        };
        let options = crate::device::options::OptionState::from_capabilities(caps);
        let ctx = ProtocolContext {
            base_uri: "http://printer.local/eSCL/",
            job_uri: None,
            options: &options,
            retry_attempt: 0,
            retry_max_attempts: 10,
            retry_interval: Duration::from_secs(1),
        };
        let mut headers = HashMap::new();
        headers.insert("Location".to_string(), "http://printer.local/eSCL/ScanJobs/1".to_string());
        let reply = HttpReply { status_code: 201, headers, body: vec![] };

        let handler = EsclHandler;
        let result = handler.decode_reply(Operation::Scan, &reply, &ctx);
        assert_eq!(result.next, NextOp::Again(Operation::Load));
        match result.payload {
            Some(Payload::JobUri(uri)) => assert_eq!(uri, "http://printer.local/eSCL/ScanJobs/1"),
            other => panic!("expected JobUri payload, got {other:?}"),
        }
    }

    #[test]
    fn load_404_finishes_cleanly() {
        let caps = Capabilities {
            units: 300,
            x: AxisCaps { min_len: 1, max_len: 2550 },
            y: AxisCaps { min_len: 1, max_len: 3300 },
            resolutions: vec![300],
            sources: vec!["Platen".to_string()],
            color_modes: vec!["RGB24".to_string()],
        };
        let options = crate::device::options::OptionState::from_capabilities(caps);
        let ctx = ProtocolContext {
            base_uri: "http://printer.local/eSCL/",
            job_uri: Some("http://printer.local/eSCL/ScanJobs/1"),
            options: &options,
            retry_attempt: 0,
            retry_max_attempts: 10,
            retry_interval: Duration::from_secs(1),
        };
        let reply = HttpReply { status_code: 404, headers: HashMap::new(), body: vec![] };
        let handler = EsclHandler;
        let result = handler.decode_reply(Operation::Load, &reply, &ctx);
        assert_eq!(result.next, NextOp::Finish);
        assert_eq!(result.status, Status::Good);
    }

    #[test]
    fn load_409_polls_status_which_resolves_back_to_load() {
        let caps = Capabilities {
            units: 300,
            x: AxisCaps { min_len: 1, max_len: 2550 },
            y: AxisCaps { min_len: 1, max_len: 3300 },
            resolutions: vec![300],
            sources: vec!["Platen".to_string()],
            color_modes: vec!["RGB24".to_string()],
        };
        let options = crate::device::options::OptionState::from_capabilities(caps);
        let ctx = ProtocolContext {
            base_uri: "http://printer.local/eSCL/",
            job_uri: Some("http://printer.local/eSCL/ScanJobs/1"),
            options: &options,
            retry_attempt: 0,
            retry_max_attempts: 10,
            retry_interval: Duration::from_secs(1),
        };
        let handler = EsclHandler;

        let jam_reply = HttpReply { status_code: 409, headers: HashMap::new(), body: vec![] };
        let result = handler.decode_reply(Operation::Load, &jam_reply, &ctx);
        assert_eq!(result.next, NextOp::Again(Operation::Status));

        let idle_reply = HttpReply { status_code: 200, headers: HashMap::new(), body: b"Idle".to_vec() };
        let result = handler.decode_reply(Operation::Status, &idle_reply, &ctx);
        assert_eq!(result.next, NextOp::Again(Operation::Load));
        assert_eq!(result.status, Status::Good);
    }

    #[test]
    fn status_jamming_retries_then_gives_up() {
        let caps = Capabilities {
            units: 300,
            x: AxisCaps { min_len: 1, max_len: 2550 },
            y: AxisCaps { min_len: 1, max_len: 3300 },
            resolutions: vec![300],
            sources: vec!["Platen".to_string()],
            color_modes: vec!["RGB24".to_string()],
        };
        let options = crate::device::options::OptionState::from_capabilities(caps);
        let handler = EsclHandler;
        let jamming = HttpReply { status_code: 200, headers: HashMap::new(), body: b"Jamming".to_vec() };

        let ctx = ProtocolContext {
            base_uri: "http://printer.local/eSCL/",
            job_uri: Some("http://printer.local/eSCL/ScanJobs/1"),
            options: &options,
            retry_attempt: 0,
            retry_max_attempts: 1,
            retry_interval: Duration::from_secs(1),
        };
        let result = handler.decode_reply(Operation::Status, &jamming, &ctx);
        assert_eq!(result.next, NextOp::Again(Operation::Status));
        assert!(result.delay > Duration::ZERO);

        let ctx = ProtocolContext { retry_attempt: 1, ..ctx };
        let result = handler.decode_reply(Operation::Status, &jamming, &ctx);
        assert_eq!(result.next, NextOp::Finish);
        assert_eq!(result.status, Status::IoError);
    }

    #[test]
    fn transient_503_retries_until_budget_exhausted() {
        let caps = Capabilities {
            units: 300,
            x: AxisCaps { min_len: 1, max_len: 2550 },
            y: AxisCaps { min_len: 1, max_len: 3300 },
            resolutions: vec![300],
            sources: vec!["Platen".to_string()],
            color_modes: vec!["RGB24".to_string()],
        };
        let options = crate::device::options::OptionState::from_capabilities(caps);
        let handler = EsclHandler;
        let reply = HttpReply { status_code: 503, headers: HashMap::new(), body: vec![] };

        for attempt in 0..10 {
            let ctx = ProtocolContext {
                base_uri: "http://printer.local/eSCL/",
                job_uri: None,
                options: &options,
                retry_attempt: attempt,
                retry_max_attempts: 10,
                retry_interval: Duration::from_secs(1),
            };
            let result = handler.decode_reply(Operation::Scan, &reply, &ctx);
            assert_eq!(result.next, NextOp::Again(Operation::Scan));
            assert!(result.delay > Duration::ZERO);
        }

        let ctx = ProtocolContext {
            base_uri: "http://printer.local/eSCL/",
            job_uri: None,
            options: &options,
            retry_attempt: 10,
            retry_max_attempts: 10,
            retry_interval: Duration::from_secs(1),
        };
        let result = handler.decode_reply(Operation::Scan, &reply, &ctx);
        assert_eq!(result.next, NextOp::Finish);
        assert_eq!(result.status, Status::IoError);
    }
}
