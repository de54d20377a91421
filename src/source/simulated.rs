//! A fake gas station that speaks the serial wire format, for running the
//! dashboard core without hardware.

use std::io;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::realtime::LocalRealtimeHub;
use super::transport::{ChunkReceiver, SerialTransport};
use super::SourceError;

pub const SIMULATED_PORT: &str = "sim0";

/// Random-walk sample generator around clean-air baselines.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    rng: StdRng,
    air_quality: f64,
    alcohol: f64,
    co: f64,
    temperature: f64,
    humidity: f64,
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            rng,
            air_quality: 150.0,
            alcohol: 10.0,
            co: 5.0,
            temperature: 28.0,
            humidity: 55.0,
        }
    }

    fn fluctuate(&mut self, value: f64, range: f64) -> f64 {
        value + (self.rng.gen::<f64>() - 0.5) * range
    }

    /// Next sample as a JSON record under canonical channel names.
    pub fn next_record(&mut self) -> Value {
        self.air_quality = self.fluctuate(self.air_quality, 50.0).clamp(50.0, 600.0);
        self.alcohol = self.fluctuate(self.alcohol, 10.0).clamp(0.0, 200.0);
        self.co = self.fluctuate(self.co, 5.0).clamp(0.0, 100.0);
        self.temperature = (self.fluctuate(self.temperature, 1.0) * 10.0).round() / 10.0;
        self.humidity = self.fluctuate(self.humidity, 5.0).clamp(30.0, 80.0);

        json!({
            "timestamp": Utc::now().to_rfc3339(),
            "air_quality": self.air_quality,
            "alcohol": self.alcohol,
            "co": self.co,
            "temperature": self.temperature,
            "humidity": self.humidity,
        })
    }

    /// Next newline-terminated JSON frame, as the serial station sends it.
    pub fn next_frame(&mut self) -> String {
        format!("{}\n", self.next_record())
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

/// Serial transport backed by a `SimulatedDevice`.
pub struct SimulatedTransport {
    interval: Duration,
    /// Frames to emit before "unplugging"; `None` runs until released.
    frame_limit: Option<usize>,
    seed: Option<u64>,
}

impl SimulatedTransport {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            frame_limit: None,
            seed: None,
        }
    }

    pub fn with_frame_limit(mut self, limit: usize) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

impl SerialTransport for SimulatedTransport {
    fn list_ports(&self) -> Result<Vec<String>, SourceError> {
        Ok(vec![SIMULATED_PORT.to_string()])
    }

    fn open(&self, port: &str, _baud_rate: u32) -> Result<ChunkReceiver, SourceError> {
        if port != SIMULATED_PORT {
            return Err(SourceError::TransportOpenFailed {
                port: port.to_string(),
                reason: "no such simulated device".to_string(),
            });
        }

        let mut device = match self.seed {
            Some(seed) => SimulatedDevice::seeded(seed),
            None => SimulatedDevice::new(),
        };
        let interval = self.interval;
        let frame_limit = self.frame_limit;
        let (tx, rx) = mpsc::channel::<io::Result<Vec<u8>>>(16);

        thread::Builder::new()
            .name("serial-sim".into())
            .spawn(move || {
                let mut sent = 0usize;
                while frame_limit.map_or(true, |limit| sent < limit) {
                    if tx.blocking_send(Ok(device.next_frame().into_bytes())).is_err() {
                        return;
                    }
                    sent += 1;
                    thread::sleep(interval);
                }
            })
            .map_err(|err| SourceError::TransportOpenFailed {
                port: port.to_string(),
                reason: err.to_string(),
            })?;

        Ok(rx)
    }
}

/// Publish simulated station records into a hub, the way the cloud station
/// updates its record, and hold the liveness flag at `true` while running.
pub fn spawn_hub_feeder(
    hub: LocalRealtimeHub,
    readings_path: String,
    liveness_path: String,
    interval: Duration,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut device = SimulatedDevice::new();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        hub.publish(&liveness_path, Value::Bool(true));

        loop {
            tokio::select! {
                _ = ticker.tick() => hub.publish(&readings_path, device.next_record()),
                _ = cancel_token.cancelled() => break,
            }
        }

        hub.publish(&liveness_path, Value::Bool(false));
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::readings::{ChannelSchema, ChannelTable, Normalizer, AIR_QUALITY, HUMIDITY};

    #[test]
    fn frames_normalize_and_stay_in_range() {
        let normalizer = Normalizer::new(ChannelTable::for_schema(ChannelSchema::V1));
        let mut device = SimulatedDevice::seeded(7);

        for _ in 0..200 {
            let frame = device.next_frame();
            assert!(frame.ends_with('\n'));
            let reading = normalizer.normalize_line(frame.trim()).unwrap();
            let aq = reading.value(AIR_QUALITY).unwrap();
            let humidity = reading.value(HUMIDITY).unwrap();
            assert!((50.0..=600.0).contains(&aq));
            assert!((30.0..=80.0).contains(&humidity));
        }
    }

    #[test]
    fn limited_device_closes_after_its_frames() {
        let transport = SimulatedTransport::new(Duration::from_millis(1))
            .with_frame_limit(3)
            .with_seed(1);
        let mut chunks = transport.open(SIMULATED_PORT, 9600).unwrap();

        let mut received = 0;
        while let Some(chunk) = chunks.blocking_recv() {
            assert!(chunk.is_ok());
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[tokio::test]
    async fn hub_feeder_publishes_until_cancelled() {
        use crate::source::realtime::RealtimeStore;

        let hub = LocalRealtimeHub::new();
        let cancel_token = CancellationToken::new();
        let feeder = spawn_hub_feeder(
            hub.clone(),
            "voc_readings/latest".into(),
            ".info/connected".into(),
            Duration::from_millis(5),
            cancel_token.clone(),
        );

        let mut readings = hub.subscribe("voc_readings/latest").unwrap();
        let normalizer = Normalizer::new(ChannelTable::for_schema(ChannelSchema::V3));
        loop {
            match readings.next().await {
                Some(Value::Null) => continue,
                Some(record) => {
                    assert!(normalizer.normalize(&record).is_ok());
                    break;
                }
                None => panic!("feed ended early"),
            }
        }
        assert_eq!(hub.value(".info/connected"), Value::Bool(true));

        cancel_token.cancel();
        feeder.await.unwrap();
        assert_eq!(hub.value(".info/connected"), Value::Bool(false));
    }

    #[test]
    fn unknown_port_fails_to_open() {
        let transport = SimulatedTransport::new(Duration::from_millis(1));
        assert!(matches!(
            transport.open("/dev/ttyUSB0", 9600),
            Err(SourceError::TransportOpenFailed { .. })
        ));
    }
}
