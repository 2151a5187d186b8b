//! Peer Service Module
//!
//! Binds the two role drivers to the loopback substrate and runs each on its
//! own tokio task. Every event a driver sees arrives through that task's
//! `select!` loop, so a driver's session and stream are only ever touched
//! from one place.

use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::info;

use crate::domain::models::{AppEvent, PeerId, Role};
use crate::domain::session::SessionConfig;
use crate::domain::settings::Settings;
use crate::infrastructure::peer::loopback::{LoopbackNetwork, LoopbackTransport};
use crate::infrastructure::peer::{
    AdvertiserDriver, BrowserDriver, BrowserEvent, Transport, TransportEvent,
};
use crate::infrastructure::sensor::{SensorSource, SimulatedSensor};

/// How often the display side checks for a stale connection attempt.
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(500);

fn now() -> std::time::Instant {
    time::Instant::now().into_std()
}

/// Drive a source peer until its transport channel closes.
pub async fn run_browser<T, S>(
    mut driver: BrowserDriver<T>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut sensor: S,
    tick_interval: Duration,
    sensor_interval: Duration,
) -> BrowserDriver<T>
where
    T: Transport,
    S: SensorSource,
{
    let mut ticks = time::interval(tick_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut samples = time::interval(sensor_interval);
    samples.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        "Source loop started (tick {:?}, sensor {:?})",
        tick_interval, sensor_interval
    );

    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => driver.handle(event.into(), now()),
                None => {
                    info!("Transport closed, stopping source loop");
                    break;
                }
            },
            _ = samples.tick() => {
                if let Some(raw) = sensor.read() {
                    driver.handle(BrowserEvent::SensorReading(raw), now());
                }
            }
            _ = ticks.tick() => driver.handle(BrowserEvent::Tick, now()),
        }
    }

    driver.teardown();
    driver
}

/// Drive a display peer until its transport channel closes.
pub async fn run_advertiser<T: Transport>(
    mut driver: AdvertiserDriver<T>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    housekeeping_interval: Duration,
) -> AdvertiserDriver<T> {
    let mut housekeeping = time::interval(housekeeping_interval);
    housekeeping.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!("Display loop started");

    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => driver.handle(event, now()),
                None => {
                    info!("Transport closed, stopping display loop");
                    break;
                }
            },
            _ = housekeeping.tick() => driver.poll(now()),
        }
    }

    driver.teardown();
    driver
}

/// Totals reported when the service stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    pub sent: u64,
    pub dropped: u64,
    pub decoded: u64,
}

/// A display peer and a source peer running over one loopback network.
pub struct PeerService {
    network: LoopbackNetwork,
    display: PeerId,
    source: PeerId,
    display_task: JoinHandle<AdvertiserDriver<LoopbackTransport>>,
    source_task: JoinHandle<BrowserDriver<LoopbackTransport>>,
}

impl PeerService {
    /// Start both peers with a simulated sensor. Must run inside a tokio runtime.
    pub fn start(
        settings: &Settings,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Result<Self> {
        Self::start_with_sensor(settings, SimulatedSensor::default(), event_sender)
    }

    pub fn start_with_sensor<S>(
        settings: &Settings,
        sensor: S,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Result<Self>
    where
        S: SensorSource + 'static,
    {
        if settings.display_name == settings.source_name {
            anyhow::bail!(
                "Display and source need distinct names, both are '{}'",
                settings.display_name
            );
        }

        let network = LoopbackNetwork::new(settings.stream_capacity_bytes());
        let config = SessionConfig {
            connect_timeout: settings.connect_timeout(),
        };
        let display_peer = PeerId::new(settings.display_name.clone());
        let source_peer = PeerId::new(settings.source_name.clone());

        // Advertise first so the browser discovers the display as it joins.
        let (transport, events) =
            network.join(display_peer.clone(), Role::Advertiser, &settings.service_type);
        let advertiser = AdvertiserDriver::new(transport, config.clone(), event_sender.clone());
        let display_task = tokio::spawn(run_advertiser(advertiser, events, HOUSEKEEPING_INTERVAL));

        let (transport, events) =
            network.join(source_peer.clone(), Role::Browser, &settings.service_type);
        let browser = BrowserDriver::new(transport, config, event_sender);
        let source_task = tokio::spawn(run_browser(
            browser,
            events,
            sensor,
            settings.tick_interval(),
            settings.sensor_interval(),
        ));

        info!("Peer service started: {} -> {}", source_peer, display_peer);

        Ok(Self {
            network,
            display: display_peer,
            source: source_peer,
            display_task,
            source_task,
        })
    }

    pub fn network(&self) -> &LoopbackNetwork {
        &self.network
    }

    /// Take the source off the network first so the display sees a peer loss,
    /// then stop the display.
    pub async fn shutdown(self) -> Result<StreamSummary> {
        self.network.drop_peer(&self.source);
        let browser = self.source_task.await?;

        self.network.drop_peer(&self.display);
        let advertiser = self.display_task.await?;

        let stats = browser.stats();
        let summary = StreamSummary {
            sent: stats.sent,
            dropped: stats.dropped,
            decoded: advertiser.decoded(),
        };
        info!(
            "Peer service stopped: {} sent, {} dropped, {} decoded",
            summary.sent, summary.dropped, summary.decoded
        );
        Ok(summary)
    }
}
