//! GPS source: serial NMEA intake and fix maintenance

use crate::fix::{FixStore, GpsFix};
use crate::timesync::TimeSync;
use crate::GpsError;
use chrono::{DateTime, Utc};
use nmea::Nmea;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

/// Upper bound on sentences drained per update tick.
const DRAIN_LIMIT: usize = 32;

/// How long a single drain read waits for more buffered data.
const DRAIN_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Poll period inside [`GpsSource::wait_for_fix`].
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// GPS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsConfig {
    /// Serial port device path (e.g. "/dev/serial0")
    pub port: String,
    /// Baud rate
    pub baudrate: u32,
    /// Whether startup blocks until a valid fix
    pub require_fix: bool,
    /// Startup fix wait budget (seconds)
    pub fix_timeout_secs: u64,
}

impl Default for GpsConfig {
    fn default() -> Self {
        Self {
            port: "/dev/serial0".to_string(),
            baudrate: 9600,
            require_fix: false,
            fix_timeout_secs: 120,
        }
    }
}

/// GPS source connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpsState {
    Disconnected,
    Connected,
    Reading,
}

enum Transport {
    Serial(BufReader<SerialStream>),
    Mock(VecDeque<String>),
}

enum Read {
    Line(String),
    Drained,
    Lost(String),
}

/// Owns the GPS transport and keeps the shared fix store current.
///
/// `update()` is driven on its own tick, independent of the capture tick;
/// the capture loop only ever touches the [`FixStore`] snapshot.
pub struct GpsSource {
    config: GpsConfig,
    transport: Option<Transport>,
    state: GpsState,
    parser: Nmea,
    store: Arc<FixStore>,
    time_sync: Option<TimeSync>,
    parse_errors: u64,
}

impl GpsSource {
    /// Open the serial port. Fails only if the port cannot be opened; no
    /// data needs to have arrived yet.
    pub fn connect(config: GpsConfig) -> Result<Self, GpsError> {
        let stream = open_port(&config)?;
        info!(port = %config.port, baud = config.baudrate, "gps port open");
        Ok(Self {
            config,
            transport: Some(Transport::Serial(BufReader::new(stream))),
            state: GpsState::Connected,
            parser: Nmea::default(),
            store: FixStore::new(),
            time_sync: None,
            parse_errors: 0,
        })
    }

    /// Source fed from canned sentences, no hardware required.
    pub fn mock<I, S>(config: GpsConfig, sentences: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            config,
            transport: Some(Transport::Mock(
                sentences.into_iter().map(Into::into).collect(),
            )),
            state: GpsState::Connected,
            parser: Nmea::default(),
            store: FixStore::new(),
            time_sync: None,
            parse_errors: 0,
        }
    }

    /// Attach GPS-driven clock sync (see [`TimeSync`]).
    pub fn with_time_sync(mut self, time_sync: TimeSync) -> Self {
        self.time_sync = Some(time_sync);
        self
    }

    /// Handle to the shared fix store for the capture loop.
    pub fn fix_store(&self) -> Arc<FixStore> {
        Arc::clone(&self.store)
    }

    pub fn state(&self) -> GpsState {
        self.state
    }

    /// Sentences that failed to parse since startup. Parse errors are
    /// expected at high frequency and never escalated.
    pub fn parse_errors(&self) -> u64 {
        self.parse_errors
    }

    /// Drain newly available sentences and refresh the fix store.
    ///
    /// Returns whether the current fix changed. An I/O failure drops the
    /// transport and leaves the source `Disconnected` for the orchestrator's
    /// recovery policy; it is not an error at this boundary.
    pub async fn update(&mut self) -> bool {
        let mut changed = false;
        self.state = match self.transport {
            Some(_) => GpsState::Reading,
            None => return false,
        };

        for _ in 0..DRAIN_LIMIT {
            match self.read_sentence().await {
                Read::Line(line) => {
                    if self.handle_sentence(line.trim()) {
                        changed = true;
                    }
                }
                Read::Drained => break,
                Read::Lost(reason) => {
                    warn!("gps transport lost: {}, disconnecting", reason);
                    self.disconnect();
                    break;
                }
            }
        }

        if self.transport.is_some() {
            self.state = GpsState::Connected;
        }
        changed
    }

    /// One bounded read from the transport.
    async fn read_sentence(&mut self) -> Read {
        match self.transport.as_mut() {
            Some(Transport::Serial(reader)) => {
                let mut buf = String::new();
                match timeout(DRAIN_READ_TIMEOUT, reader.read_line(&mut buf)).await {
                    Err(_) => Read::Drained, // nothing more buffered right now
                    Ok(Ok(0)) => Read::Lost("EOF".to_string()),
                    Ok(Ok(_)) => Read::Line(buf),
                    Ok(Err(e)) => Read::Lost(e.to_string()),
                }
            }
            Some(Transport::Mock(queue)) => match queue.pop_front() {
                Some(line) => Read::Line(line),
                None => Read::Drained,
            },
            None => Read::Drained,
        }
    }

    /// Current fix, or `None` if never received or stale.
    pub fn current_fix(&self) -> Option<Arc<GpsFix>> {
        self.store.latest()
    }

    /// Poll until a *valid* fix appears or the timeout elapses.
    ///
    /// Startup-only: the hot capture path never blocks on this.
    pub async fn wait_for_fix(&mut self, budget: Duration) -> Result<Arc<GpsFix>, GpsError> {
        let started = Instant::now();
        loop {
            self.update().await;
            if let Some(fix) = self.current_fix() {
                if fix.is_valid() {
                    return Ok(fix);
                }
            }
            if started.elapsed() >= budget {
                return Err(GpsError::FixTimeout(budget));
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Re-open the serial port after an I/O failure. Each call is a fresh,
    /// independent attempt.
    pub fn reconnect(&mut self) -> Result<(), GpsError> {
        self.disconnect();
        let stream = open_port(&self.config)?;
        info!(port = %self.config.port, "gps port reopened");
        self.transport = Some(Transport::Serial(BufReader::new(stream)));
        self.state = GpsState::Connected;
        Ok(())
    }

    /// Release the transport.
    pub fn shutdown(&mut self) {
        self.disconnect();
    }

    fn disconnect(&mut self) {
        self.transport = None;
        self.state = GpsState::Disconnected;
    }

    /// Parse one sentence; malformed input is counted and skipped silently.
    fn handle_sentence(&mut self, line: &str) -> bool {
        if line.is_empty() {
            return false;
        }
        if let Err(e) = self.parser.parse(line) {
            self.parse_errors += 1;
            debug!("unparsable sentence skipped: {:?}", e);
            return false;
        }
        // Only positioning sentences overwrite the fix; GSV/GSA/VTG etc.
        // update parser state without refreshing staleness.
        if !is_position_sentence(line) {
            return false;
        }

        // Clock sync first: the fix must not be published against a stale
        // time base offset.
        let gps_datetime = self.gps_datetime();
        if let (Some(ts), Some(sync)) = (gps_datetime, self.time_sync.as_mut()) {
            sync.maybe_sync(ts);
        }

        let fix = GpsFix {
            latitude: self.parser.latitude.unwrap_or(0.0),
            longitude: self.parser.longitude.unwrap_or(0.0),
            altitude: self.parser.altitude.map(f64::from),
            fix_quality: fix_quality(self.parser.fix_type.as_ref()),
            satellites_used: self.parser.num_of_fix_satellites.unwrap_or(0),
            hdop: self.parser.hdop,
            timestamp_utc: gps_datetime.unwrap_or_else(Utc::now),
        };
        self.store.publish(fix)
    }

    /// Full UTC datetime when the parser has seen both date and time.
    fn gps_datetime(&self) -> Option<DateTime<Utc>> {
        let date = self.parser.fix_date?;
        let time = self.parser.fix_time?;
        Some(date.and_time(time).and_utc())
    }
}

/// GGA/RMC/GLL carry a position; the type token follows the two-character
/// talker id.
fn is_position_sentence(line: &str) -> bool {
    let Some(body) = line.strip_prefix('$') else {
        return false;
    };
    matches!(body.get(2..5), Some("GGA") | Some("RMC") | Some("GLL"))
}

fn open_port(config: &GpsConfig) -> Result<SerialStream, GpsError> {
    tokio_serial::new(&config.port, config.baudrate)
        .timeout(Duration::from_secs(1))
        .open_native_async()
        .map_err(|source| GpsError::Open {
            port: config.port.clone(),
            source,
        })
}

fn fix_quality(fix_type: Option<&nmea::sentences::FixType>) -> u8 {
    use nmea::sentences::FixType;
    match fix_type {
        None | Some(FixType::Invalid) => 0,
        Some(FixType::Gps) => 1,
        Some(FixType::DGps) => 2,
        Some(FixType::Pps) => 3,
        Some(FixType::Rtk) => 4,
        Some(FixType::FloatRtk) => 5,
        Some(FixType::Estimated) => 6,
        Some(FixType::Manual) => 7,
        Some(FixType::Simulation) => 8,
    }
}
