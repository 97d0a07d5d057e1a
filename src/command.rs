//! Pure construction of the child's argument vector (spec section 4.7).
//!
//! Takes a validated [`SupervisorConfig`] and returns the argv the
//! supervisor will spawn the child binary with. Contains no IO and no
//! process knowledge — it is a pure function, easy to golden-test.

use crate::config::{Codec, InputFormat, SupervisorConfig};

const STREAMING_SCHEME: &str = "rtsp://";
const RECONNECT_MAX_DELAY_SECONDS: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputKind {
    Streaming,
    Null,
    File,
}

/// Classifies the output target, honoring an explicit `output_format`
/// override (spec section 6: "optional; one of rtsp, null, empty for
/// auto-detect") before falling back to heuristics on `output_url`.
fn classify_output(url: &str, format_override: Option<&str>) -> OutputKind {
    match format_override.map(str::trim) {
        Some("rtsp") => return OutputKind::Streaming,
        Some("null") => return OutputKind::Null,
        _ => {}
    }

    if url == "-" || url == "/dev/null" || url.starts_with("pipe:") {
        OutputKind::Null
    } else if url.starts_with(STREAMING_SCHEME) {
        OutputKind::Streaming
    } else if url.contains('/') && !url.contains("://") {
        OutputKind::File
    } else {
        OutputKind::Streaming
    }
}

fn codec_name(codec: Codec) -> &'static str {
    match codec {
        Codec::Opus => "libopus",
        Codec::Aac => "aac",
    }
}

fn input_format_name(format: InputFormat) -> &'static str {
    match format {
        InputFormat::Alsa => "alsa",
        InputFormat::Lavfi => "lavfi",
    }
}

/// Builds the argv for the child encoder process from a validated config.
///
/// See spec section 4.7 for the full contract: input-source selection,
/// codec mapping, output classification, and the split-output case where
/// a local recording directory is configured alongside a streaming
/// output.
pub fn build_command_args(config: &SupervisorConfig) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();

    args.push("-f".into());
    args.push(input_format_name(config.input_format).into());
    args.push("-i".into());
    args.push(config.capture_source_id.clone());

    args.push("-ar".into());
    args.push(config.sample_rate.to_string());
    args.push("-ac".into());
    args.push(config.channels.to_string());
    if let Some(queue) = config.thread_queue {
        args.push("-thread_queue_size".into());
        args.push(queue.to_string());
    }

    args.push("-c:a".into());
    args.push(codec_name(config.codec).into());
    args.push("-b:a".into());
    args.push(config.bitrate.clone());

    let output_kind = classify_output(&config.output_url, config.output_format.as_deref());
    let wants_split = config.local_record_dir.is_some() && output_kind == OutputKind::Streaming;

    if wants_split {
        args.extend(split_output_args(config));
    } else {
        match output_kind {
            OutputKind::Streaming => args.extend(streaming_output_args(&config.output_url)),
            OutputKind::Null => args.push("/dev/null".into()),
            OutputKind::File => args.push(config.output_url.clone()),
        }
    }

    args
}

fn streaming_output_spec(url: &str) -> String {
    format!(
        "[f=rtsp:reconnect=1:reconnect_streamed=1:reconnect_delay_max={}]{}",
        RECONNECT_MAX_DELAY_SECONDS, url
    )
}

fn streaming_output_args(url: &str) -> Vec<String> {
    vec![streaming_output_spec(url)]
}

fn segment_pattern(config: &SupervisorConfig, dir: &std::path::Path) -> String {
    format!(
        "{}/{}_%Y%m%d_%H%M%S.{}",
        dir.display(),
        config.stream_name,
        config.segment_format()
    )
}

fn split_output_args(config: &SupervisorConfig) -> Vec<String> {
    let dir = config
        .local_record_dir
        .as_deref()
        .expect("wants_split implies local_record_dir is set");

    let streaming = streaming_output_spec(&config.output_url);
    let segment_spec = format!(
        "[f=segment:segment_time={}:strftime=1]{}",
        config.segment_duration_seconds(),
        segment_pattern(config, dir),
    );

    vec![format!("tee:{}|{}", streaming, segment_spec)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn base_config() -> SupervisorConfig {
        SupervisorConfig {
            device_name: "hw_0_0".into(),
            capture_source_id: "hw:0,0".into(),
            input_format: InputFormat::Alsa,
            stream_name: "mystream".into(),
            sample_rate: 48_000,
            channels: 2,
            bitrate: "128k".into(),
            codec: Codec::Opus,
            thread_queue: None,
            output_url: "rtsp://example.invalid/live/mystream".into(),
            output_format: None,
            lock_dir: "/tmp/locks".into(),
            child_binary_path: "/usr/bin/ffmpeg".into(),
            backoff: None,
            log_dir: None,
            monitor_interval: None,
            stop_timeout: None,
            local_record_dir: None,
            segment_duration_seconds: None,
            segment_format: None,
        }
    }

    #[test]
    fn maps_opus_to_libopus_and_aac_to_aac() {
        let mut cfg = base_config();
        cfg.codec = Codec::Opus;
        assert!(build_command_args(&cfg).iter().any(|a| a == "libopus"));

        cfg.codec = Codec::Aac;
        assert!(build_command_args(&cfg).iter().any(|a| a == "aac"));
    }

    #[test]
    fn streaming_url_gets_reconnect_flags_embedded() {
        let cfg = base_config();
        let args = build_command_args(&cfg);
        let out = args.last().unwrap();
        assert!(out.contains("reconnect=1"));
        assert!(out.contains("reconnect_streamed=1"));
        assert!(out.contains("reconnect_delay_max=30"));
        assert!(out.contains(&cfg.output_url));
    }

    #[test]
    fn null_output_urls_map_to_dev_null() {
        for url in ["-", "/dev/null", "pipe:1"] {
            let mut cfg = base_config();
            cfg.output_url = url.into();
            let args = build_command_args(&cfg);
            assert_eq!(args.last().unwrap(), "/dev/null");
        }
    }

    #[test]
    fn path_like_output_without_scheme_is_file_output() {
        let mut cfg = base_config();
        cfg.output_url = "/var/recordings/out.wav".into();
        let args = build_command_args(&cfg);
        assert_eq!(args.last().unwrap(), "/var/recordings/out.wav");
    }

    #[test]
    fn local_record_dir_with_streaming_output_builds_split_output() {
        let mut cfg = base_config();
        cfg.local_record_dir = Some(PathBuf::from("/var/recordings"));
        let args = build_command_args(&cfg);
        let out = args.last().unwrap();

        assert!(out.starts_with("tee:"));
        assert!(out.contains("reconnect=1"), "reconnect flags must be nested in the streaming branch");
        assert!(out.contains("segment_time=3600"));
        assert!(out.contains("mystream_%Y%m%d_%H%M%S.wav"));
    }

    #[test]
    fn split_output_uses_configured_segment_duration_and_format() {
        let mut cfg = base_config();
        cfg.local_record_dir = Some(PathBuf::from("/var/recordings"));
        cfg.segment_duration_seconds = Some(1800);
        cfg.segment_format = Some("flac".into());
        let args = build_command_args(&cfg);
        let out = args.last().unwrap();

        assert!(out.contains("segment_time=1800"));
        assert!(out.contains(".flac"));
    }

    #[test]
    fn output_format_rtsp_override_forces_streaming_even_for_a_path_like_url() {
        let mut cfg = base_config();
        cfg.output_url = "/var/recordings/out.wav".into();
        cfg.output_format = Some("rtsp".into());
        let args = build_command_args(&cfg);
        assert!(args.last().unwrap().contains("reconnect=1"));
    }

    #[test]
    fn output_format_null_override_forces_dev_null_even_for_a_streaming_url() {
        let mut cfg = base_config();
        cfg.output_format = Some("null".into());
        let args = build_command_args(&cfg);
        assert_eq!(args.last().unwrap(), "/dev/null");
    }

    #[test]
    fn empty_output_format_falls_back_to_auto_detect() {
        let mut cfg = base_config();
        cfg.output_format = Some("".into());
        let args = build_command_args(&cfg);
        assert!(args.last().unwrap().contains("reconnect=1"));
    }

    #[test]
    fn local_record_dir_without_streaming_output_does_not_split() {
        let mut cfg = base_config();
        cfg.output_url = "/var/recordings/out.wav".into();
        cfg.local_record_dir = Some(PathBuf::from("/var/recordings"));
        let args = build_command_args(&cfg);
        assert!(!args.last().unwrap().starts_with("tee:"));
    }
}
