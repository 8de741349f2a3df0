mod config;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{info, warn};

use mqtt_ota::progress::{STATE_COMPLETE, STATE_ERROR};
use mqtt_ota::{MqttTransport, Topics, TracingLogger, UploadProgress, UploadSession};

use crate::config::Settings;

const USAGE: &str = "\
Usage: mqtt-ota [FIRMWARE_FILE]

Uploads a firmware file to a device over MQTT. Settings come from the
environment (or a .env file):

  OTA_TOPIC               device topic (required)
  OTA_FILE                firmware file, if not given as argument
  OTA_BROKER_HOST         broker host [localhost]
  OTA_BROKER_PORT         broker port [1883]
  OTA_CLIENT_ID           MQTT client id [mqtt-ota-<pid>]
  OTA_CONNECT_TIMEOUT_MS  wait for CONNACK [5000]
  OTA_FILE_TYPE           file type tag [1]
  OTA_SESSION_ID          even id in 2..=254 [114]
  OTA_CHUNK_SIZE          chunk size before negotiation [700]
  OTA_ACK_TIMEOUT_MS      acknowledgment wait [1000]
  OTA_ON_FAILURE          continue | abort | retry | retry:<n> [continue]
  OTA_ERROR_ENDS_WAIT     stop waiting on device error [false]";

/// Interval between progress lines.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// How often the reporter checks for the end of the session.
const PROGRESS_POLL: Duration = Duration::from_millis(100);

fn main() -> anyhow::Result<()> {
    let file_arg = std::env::args().nth(1);
    if matches!(file_arg.as_deref(), Some("-h") | Some("--help")) {
        println!("{}", USAGE);
        return Ok(());
    }

    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mqtt_ota=info,mqtt_ota_cli=info".into()),
        )
        .init();

    let settings = Settings::from_env(file_arg)?;
    let topics = Topics::for_device(&settings.topic);
    let (acks, sink) = settings.upload.ack_tracker(&topics);

    info!(
        "Uploading file {} to {} ...",
        settings.upload.file_path.display(),
        settings.topic
    );

    let transport = MqttTransport::connect(&settings.broker, sink)
        .with_context(|| format!("cannot connect to broker {}", settings.broker.addr()))?;

    let progress = Arc::new(UploadProgress::new());
    let reporter = spawn_progress_reporter(progress.clone());

    let result = UploadSession::new(settings.upload.clone(), topics, transport, acks)
        .map(|session| {
            session
                .with_logger(Arc::new(TracingLogger))
                .with_progress(progress.clone())
        })
        .and_then(|session| session.run());

    if result.is_err() {
        progress.state.store(STATE_ERROR, Ordering::Relaxed);
    }
    let _ = reporter.join();

    let report = result.context("upload failed")?;

    info!("Done in {:.2} seconds", report.elapsed.as_secs_f64());
    info!(
        "Sent {} of {} bytes in {} chunks of up to {} bytes, md5 {}",
        report.bytes_sent, report.file_size, report.chunks_sent, report.chunk_size, report.md5
    );
    if report.ack_timeouts > 0 || report.device_errors > 0 {
        warn!(
            "{} acknowledgment timeout(s), {} device error(s), {} retry(ies): verify the device accepted the image",
            report.ack_timeouts, report.device_errors, report.retries
        );
    }

    Ok(())
}

/// Log progress until the session completes or fails.
fn spawn_progress_reporter(progress: Arc<UploadProgress>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut last = Instant::now();
        loop {
            if is_finished(progress.state()) {
                break;
            }
            thread::sleep(PROGRESS_POLL);
            if last.elapsed() < PROGRESS_INTERVAL || is_finished(progress.state()) {
                continue;
            }
            last = Instant::now();
            info!("{}", progress_line(&progress));
        }
    })
}

fn is_finished(state: u8) -> bool {
    state == STATE_COMPLETE || state == STATE_ERROR
}

fn progress_line(progress: &UploadProgress) -> String {
    let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
    let mut line = format!(
        "Progress {:.0}% ({} of {} bytes, {} chunks of {} bytes)",
        progress.fraction() * 100.0,
        load(&progress.bytes_done),
        load(&progress.bytes_total),
        load(&progress.chunks_sent),
        load(&progress.chunk_size),
    );
    let (timeouts, errors, retries) = (
        load(&progress.ack_timeouts),
        load(&progress.device_errors),
        load(&progress.retries),
    );
    if timeouts + errors + retries > 0 {
        line.push_str(&format!(
            ", {} timeouts, {} device errors, {} retries",
            timeouts, errors, retries
        ));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqtt_ota::progress::STATE_CHUNKS;

    #[test]
    fn reporter_stops_promptly_when_finished() {
        let progress = Arc::new(UploadProgress::new());
        progress.state.store(STATE_CHUNKS, Ordering::Relaxed);
        let reporter = spawn_progress_reporter(progress.clone());

        thread::sleep(Duration::from_millis(50));
        progress.state.store(STATE_COMPLETE, Ordering::Relaxed);
        let start = Instant::now();
        reporter.join().unwrap();

        assert!(start.elapsed() < PROGRESS_INTERVAL);
    }

    #[test]
    fn progress_line_shows_counters() {
        let progress = UploadProgress::new();
        progress.bytes_total.store(1400, Ordering::Relaxed);
        progress.bytes_done.store(700, Ordering::Relaxed);
        progress.chunks_sent.store(1, Ordering::Relaxed);
        progress.chunk_size.store(700, Ordering::Relaxed);
        assert_eq!(
            progress_line(&progress),
            "Progress 50% (700 of 1400 bytes, 1 chunks of 700 bytes)"
        );

        progress.ack_timeouts.store(2, Ordering::Relaxed);
        progress.retries.store(1, Ordering::Relaxed);
        assert!(progress_line(&progress).ends_with(", 2 timeouts, 0 device errors, 1 retries"));
    }
}
