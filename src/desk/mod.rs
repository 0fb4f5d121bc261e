pub mod bluetooth;
pub mod gatt;
pub mod protocol;
pub mod units;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use crate::config::SharedConfig;
use bluetooth::DeskLink;
use futures::StreamExt;
use gatt::GattAccessor;
use protocol::{ControlCommand, DeskProtocol, DpgCommand};
use units::{Height, HeightAndSpeed};

/// Fallback when neither configuration nor the desk supplies a base height.
const DEFAULT_BASE_HEIGHT_MM: u16 = 640;

/// The DPG channel has no acknowledgment; this delay between write and
/// read stands in for synchronization. Known-fragile, kept as observed on
/// hardware.
const DPG_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Extra settle time after the upward nudge that precedes a downward move.
const ANTI_STICK_SETTLE: Duration = Duration::from_millis(3000);

/// Upper bound on one move. Desk travel end to end is 10-20s; a loop still
/// running past this is stuck.
const MAX_MOVE_DURATION: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum DeskError {
    #[error("characteristic {0} not found on desk")]
    CharacteristicNotFound(Uuid),
    #[error("height {0}mm is outside the encodable range")]
    InvalidHeightValue(f64),
    #[error("undecodable telemetry frame ({0} bytes)")]
    Telemetry(usize),
    #[error("move did not settle within {0:?}")]
    MoveTimeout(Duration),
    #[error(transparent)]
    Transport(#[from] btleplug::Error),
}

/// Driver facade for one Linak desk. All device-touching operations run
/// under a single lock; overlapping calls serialize.
pub struct Desk {
    accessor: GattAccessor,
    protocol: DeskProtocol,
    config: SharedConfig,
    op_lock: Mutex<()>,
    shutdown: watch::Receiver<bool>,
}

impl Desk {
    pub fn new(
        link: Arc<dyn DeskLink>,
        protocol: DeskProtocol,
        config: SharedConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            accessor: GattAccessor::new(link),
            protocol,
            config,
            op_lock: Mutex::new(()),
            shutdown,
        }
    }

    /// Query the desk's DPG channel and back-fill configuration: log
    /// capabilities, fix up the user id for DPG1C units, and take the base
    /// height from the desk when the configuration leaves it open.
    pub async fn initialize(&self) -> Result<(), DeskError> {
        let _guard = self.op_lock.lock().await;

        match self
            .dpg_read(DpgCommand::GetCapabilities)
            .await?
            .as_deref()
            .and_then(protocol::decode_capabilities)
        {
            Some(capabilities) => log::info!("Desk capabilities: {:?}", capabilities),
            None => log::info!("Desk reported no capability data"),
        }

        if let Some(mut user_id) = self.dpg_read(DpgCommand::UserId).await? {
            log::debug!("User id: {:02X?}", user_id);
            if user_id.first().is_some_and(|byte| *byte != 1) {
                // DPG1C units only accept commands once the first byte is 1;
                // the remaining bytes do not matter.
                user_id[0] = 1;
                log::info!("Rewriting user id to {:02X?}", user_id);
                self.dpg_write(DpgCommand::UserId, &user_id).await?;
            }
        }

        if self.config.read().await.base_height.is_none() {
            if let Some(response) = self.dpg_read(DpgCommand::BaseOffset).await? {
                if response.len() >= 3 {
                    let offset = u16::from_le_bytes([response[1], response[2]]);
                    let base_height = offset / 10;
                    log::info!("Base height from desk: {}mm", base_height);
                    self.config.write().await.base_height = Some(base_height);
                }
            }
        }

        let mut guard = self.config.write().await;
        let config = &mut *guard;
        let base_height = *config.base_height.get_or_insert(DEFAULT_BASE_HEIGHT_MM);
        let max_height = config.max_height.get_or_insert(base_height + 10);
        if *max_height < base_height {
            log::warn!(
                "Configured max height {}mm is below base height {}mm, clamping",
                max_height,
                base_height
            );
            *max_height = base_height;
        }
        log::info!(
            "Operating range: {}mm to {}mm",
            base_height,
            *max_height
        );

        Ok(())
    }

    /// Current height and speed, read straight from the desk.
    pub async fn get_height_speed(&self) -> Result<HeightAndSpeed, DeskError> {
        let _guard = self.op_lock.lock().await;
        self.poll_height_speed().await
    }

    /// Drive the desk to `target` and return once it has physically
    /// stopped. Stopping short (travel limit, manual interruption) is not
    /// distinguished from arrival; callers read back the height for the
    /// authoritative outcome.
    pub async fn move_to(&self, target: Height) -> Result<(), DeskError> {
        let _guard = self.op_lock.lock().await;
        self.run_move(target).await
    }

    /// Subscribe to telemetry notifications for the process lifetime. The
    /// returned channel always holds the latest snapshot; the background
    /// task unsubscribes when the shutdown signal fires.
    pub async fn watch_height_speed(
        &self,
    ) -> Result<watch::Receiver<HeightAndSpeed>, DeskError> {
        let _guard = self.op_lock.lock().await;

        let initial = self.poll_height_speed().await?;
        let (tx, rx) = watch::channel(initial);

        let uuid = self.protocol.reference_output;
        self.accessor.subscribe(uuid).await?;
        let stream = self.accessor.notifications(uuid).await?;

        let accessor = self.accessor.clone();
        let config = self.config.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut stream = stream;
            loop {
                tokio::select! {
                    notification = stream.next() => match notification {
                        Some(value) => {
                            let base_height = config
                                .read()
                                .await
                                .base_height
                                .unwrap_or(DEFAULT_BASE_HEIGHT_MM);
                            match protocol::decode_height_speed(&value, base_height) {
                                Some(snapshot) => {
                                    log::debug!(
                                        "Height: {:.0}mm Speed: {:.0}mm/s",
                                        snapshot.height.human(),
                                        snapshot.speed.human()
                                    );
                                    let _ = tx.send(snapshot);
                                }
                                None => log::warn!(
                                    "Undecodable telemetry notification ({} bytes)",
                                    value.len()
                                ),
                            }
                        }
                        None => {
                            log::warn!("Telemetry stream ended");
                            break;
                        }
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            if let Err(e) = accessor.unsubscribe(uuid).await {
                log::debug!("Telemetry unsubscribe failed: {}", e);
            }
        });

        Ok(rx)
    }

    /// Command the desk to stop. Errors are logged and suppressed: some
    /// platforms report a permission failure when the desk is already idle.
    async fn stop(&self) -> Result<(), DeskError> {
        let frame = ControlCommand::Stop.to_bytes();
        match self
            .accessor
            .write(self.protocol.control_command, &frame, false)
            .await
        {
            Err(DeskError::Transport(e)) => {
                log::debug!("Stop command not accepted: {}", e);
                Ok(())
            }
            other => other,
        }
    }

    async fn wakeup(&self) -> Result<(), DeskError> {
        let frame = ControlCommand::Wakeup.to_bytes();
        self.accessor
            .write(self.protocol.control_command, &frame, false)
            .await
    }

    async fn run_move(&self, target: Height) -> Result<(), DeskError> {
        let current = self.poll_height_speed().await?;
        if current.height.value() == target.value() {
            log::info!("Already at {}mm", units::format_number(target.human()));
            return Ok(());
        }

        // Wakeup is fire-and-forget: there is no ack, and it is idempotent
        // if the desk is already awake. Stop cancels any in-flight motion so
        // the reference input starts from a known state.
        self.wakeup().await?;
        self.stop().await?;

        let (period, max_height, base_height) = {
            let config = self.config.read().await;
            let base_height = config.base_height.unwrap_or(DEFAULT_BASE_HEIGHT_MM);
            (
                config.move_command_duration(),
                config.max_height.unwrap_or(base_height + 10),
                base_height,
            )
        };

        if target.value() < current.height.value() {
            // Some controllers mechanically stick when commanded to reverse
            // direction right after a stop; nudge upward first.
            let top = Height::from_human(max_height as f64, base_height);
            let payload = protocol::encode_target_height(&top)?;
            self.accessor
                .write(self.protocol.reference_input, &payload, false)
                .await?;
            sleep(period).await;
            sleep(ANTI_STICK_SETTLE).await;
        }

        let payload = protocol::encode_target_height(&target)?;
        let deadline = Instant::now() + MAX_MOVE_DURATION;
        let mut shutdown = self.shutdown.clone();

        loop {
            if Instant::now() >= deadline {
                return Err(DeskError::MoveTimeout(MAX_MOVE_DURATION));
            }

            // The target must be re-sent every period: the desk reverts to
            // manual control when the reference input goes stale.
            self.accessor
                .write(self.protocol.reference_input, &payload, false)
                .await?;

            tokio::select! {
                _ = sleep(period) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        log::warn!(
                            "Move to {}mm cancelled by shutdown",
                            units::format_number(target.human())
                        );
                        return Ok(());
                    }
                }
            }

            let snapshot = self.poll_height_speed().await?;
            if snapshot.speed.value() == 0 {
                break;
            }
            log::info!(
                "Height: {:.0}mm Speed: {:.0}mm/s",
                snapshot.height.human(),
                snapshot.speed.human()
            );
        }

        Ok(())
    }

    async fn poll_height_speed(&self) -> Result<HeightAndSpeed, DeskError> {
        let base_height = self.base_height().await;
        let data = self.accessor.read(self.protocol.reference_output).await?;
        protocol::decode_height_speed(&data, base_height)
            .ok_or(DeskError::Telemetry(data.len()))
    }

    /// One DPG exchange in read shape: subscribe, write the command frame,
    /// wait out the settle delay, read the value back, unsubscribe.
    async fn dpg_read(&self, command: DpgCommand) -> Result<Option<Vec<u8>>, DeskError> {
        let uuid = self.protocol.dpg;
        self.accessor.subscribe(uuid).await?;
        self.accessor
            .write(uuid, &protocol::dpg_read_frame(command), false)
            .await?;
        sleep(DPG_SETTLE_DELAY).await;
        let value = self.accessor.read(uuid).await?;
        self.accessor.unsubscribe(uuid).await?;
        Ok(protocol::parse_dpg_response(&value))
    }

    /// One DPG exchange in write shape. No result comes back.
    async fn dpg_write(&self, command: DpgCommand, payload: &[u8]) -> Result<(), DeskError> {
        let uuid = self.protocol.dpg;
        self.accessor.subscribe(uuid).await?;
        let result = self
            .accessor
            .write(uuid, &protocol::dpg_write_frame(command, payload), false)
            .await;
        self.accessor.unsubscribe(uuid).await?;
        result
    }

    /// Issue the stop command and release the link. Used on shutdown.
    pub async fn park(&self) {
        let _guard = self.op_lock.lock().await;
        if let Err(e) = self.stop().await {
            log::debug!("Parking stop failed: {}", e);
        }
        if let Err(e) = self.accessor.disconnect().await {
            log::debug!("Disconnect failed: {}", e);
        }
    }

    async fn base_height(&self) -> u16 {
        self.config
            .read()
            .await
            .base_height
            .unwrap_or(DEFAULT_BASE_HEIGHT_MM)
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::{watch, RwLock};

    use super::protocol::DeskProtocol;
    use super::testing::MockLink;
    use super::units::Height;
    use super::*;
    use crate::config::Config;

    const PROTOCOL: DeskProtocol = DeskProtocol::LINAK;

    fn test_config(base_height: Option<u16>, max_height: Option<u16>) -> SharedConfig {
        Arc::new(RwLock::new(Config {
            base_height,
            max_height,
            move_command_period: 0.05,
            ..Config::default()
        }))
    }

    fn desk_with(
        link: Arc<MockLink>,
        config: SharedConfig,
    ) -> (Desk, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (Desk::new(link, PROTOCOL, config, rx), tx)
    }

    /// Telemetry frame: height in tenths of a mm over base, speed in
    /// hundredths of a mm/s.
    fn telemetry(height: u16, speed: i16) -> Vec<u8> {
        let mut frame = height.to_le_bytes().to_vec();
        frame.extend_from_slice(&speed.to_le_bytes());
        frame
    }

    #[tokio::test(start_paused = true)]
    async fn dpg_read_returns_payload_of_valid_response() {
        let link = Arc::new(MockLink::linak());
        link.set_read(PROTOCOL.dpg, vec![0x01, 0x00, 0xAA, 0xBB]);
        let (desk, _shutdown) = desk_with(link.clone(), test_config(Some(640), Some(1300)));

        let response = desk.dpg_read(DpgCommand::GetCapabilities).await.unwrap();
        assert_eq!(response, Some(vec![0xAA, 0xBB]));

        assert_eq!(link.writes_to(PROTOCOL.dpg), vec![vec![0x7F, 128, 0x00]]);
        assert_eq!(link.subscribed(), vec![PROTOCOL.dpg]);
        assert_eq!(link.unsubscribed(), vec![PROTOCOL.dpg]);
    }

    #[tokio::test(start_paused = true)]
    async fn dpg_read_treats_invalid_response_as_no_result() {
        let link = Arc::new(MockLink::linak());
        link.set_read(PROTOCOL.dpg, vec![0x00, 0x00, 0xAA]);
        let (desk, _shutdown) = desk_with(link, test_config(Some(640), Some(1300)));

        let response = desk.dpg_read(DpgCommand::GetCapabilities).await.unwrap();
        assert_eq!(response, None);
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_rewrites_user_id_and_falls_back_on_base_height() {
        let link = Arc::new(MockLink::linak());
        // Same canned response serves every DPG read: capabilities decode,
        // a user id whose first byte is not 1, and a base-offset payload
        // too short to use.
        link.set_read(PROTOCOL.dpg, vec![0x01, 0x00, 0x03, 0x00]);
        let config = test_config(None, None);
        let (desk, _shutdown) = desk_with(link.clone(), config.clone());

        desk.initialize().await.unwrap();

        let dpg_writes = link.writes_to(PROTOCOL.dpg);
        assert!(dpg_writes.contains(&vec![0x7F, 134, 0x80, 0x01, 0x00]));

        let config = config.read().await;
        assert_eq!(config.base_height, Some(640));
        assert_eq!(config.max_height, Some(650));
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_takes_base_height_from_desk() {
        let link = Arc::new(MockLink::linak());
        // Base offset payload: status byte then 6210 (621.0mm) as u16 LE.
        link.set_read(PROTOCOL.dpg, vec![0x01, 0x00, 0x00, 0x42, 0x18]);
        let config = test_config(None, Some(1300));
        let (desk, _shutdown) = desk_with(link, config.clone());

        desk.initialize().await.unwrap();

        assert_eq!(config.read().await.base_height, Some(621));
    }

    #[tokio::test(start_paused = true)]
    async fn move_to_current_height_issues_no_writes() {
        let link = Arc::new(MockLink::linak());
        link.set_read(PROTOCOL.reference_output, telemetry(1000, 0));
        let (desk, _shutdown) = desk_with(link.clone(), test_config(Some(640), Some(1300)));

        desk.move_to(Height::from_internal(1000, 640)).await.unwrap();

        assert!(link.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn upward_move_sends_target_until_settled() {
        let link = Arc::new(MockLink::linak());
        link.set_read(PROTOCOL.reference_output, telemetry(1000, 0));
        let (desk, _shutdown) = desk_with(link.clone(), test_config(Some(640), Some(1300)));

        desk.move_to(Height::from_internal(2600, 640)).await.unwrap();

        assert_eq!(
            link.writes_to(PROTOCOL.control_command),
            vec![
                ControlCommand::Wakeup.to_bytes().to_vec(),
                ControlCommand::Stop.to_bytes().to_vec(),
            ]
        );
        // Speed reads back 0 immediately, so exactly one target write.
        assert_eq!(
            link.writes_to(PROTOCOL.reference_input),
            vec![2600u16.to_le_bytes().to_vec()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn downward_move_nudges_to_max_height_first() {
        let link = Arc::new(MockLink::linak());
        link.set_read(PROTOCOL.reference_output, telemetry(3000, 0));
        let (desk, _shutdown) = desk_with(link.clone(), test_config(Some(640), Some(1300)));

        desk.move_to(Height::from_internal(2000, 640)).await.unwrap();

        // (1300 - 640) * 10 = 6600: the anti-stick nudge goes to max height
        // strictly before the target is written.
        assert_eq!(
            link.writes_to(PROTOCOL.reference_input),
            vec![
                6600u16.to_le_bytes().to_vec(),
                2000u16.to_le_bytes().to_vec(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn move_times_out_when_desk_never_settles() {
        let link = Arc::new(MockLink::linak());
        link.set_read(PROTOCOL.reference_output, telemetry(1000, 500));
        let (desk, _shutdown) = desk_with(link, test_config(Some(640), Some(1300)));

        let result = desk.move_to(Height::from_internal(2600, 640)).await;
        assert!(matches!(result, Err(DeskError::MoveTimeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn move_stops_at_polling_boundary_on_shutdown() {
        let link = Arc::new(MockLink::linak());
        link.set_read(PROTOCOL.reference_output, telemetry(1000, 500));
        let (desk, shutdown) = desk_with(link.clone(), test_config(Some(640), Some(1300)));
        let desk = Arc::new(desk);

        let mover = {
            let desk = desk.clone();
            tokio::spawn(async move { desk.move_to(Height::from_internal(2600, 640)).await })
        };

        // Let the loop issue at least one write before cancelling.
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.send(true).unwrap();

        let result = mover.await.unwrap();
        assert!(result.is_ok());
        assert!(!link.writes_to(PROTOCOL.reference_input).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_watch_decodes_notifications() {
        let link = Arc::new(MockLink::linak());
        link.set_read(PROTOCOL.reference_output, telemetry(1000, 0));
        let (desk, shutdown) = desk_with(link.clone(), test_config(Some(640), Some(1300)));

        let mut rx = desk.watch_height_speed().await.unwrap();
        assert_eq!(rx.borrow().height.value(), 1000);
        assert_eq!(link.subscribed(), vec![PROTOCOL.reference_output]);

        link.push_notification(PROTOCOL.reference_output, telemetry(2600, -100));
        rx.changed().await.unwrap();
        let snapshot = *rx.borrow();
        assert_eq!(snapshot.height.value(), 2600);
        assert_eq!(snapshot.speed.human(), -1.0);

        // Shutdown tears the listener down and unsubscribes.
        shutdown.send(true).unwrap();
        for _ in 0..50 {
            if !link.unsubscribed().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(link.unsubscribed(), vec![PROTOCOL.reference_output]);
    }

    #[tokio::test]
    async fn missing_characteristic_is_reported() {
        struct EmptyLink;

        #[async_trait::async_trait]
        impl bluetooth::DeskLink for EmptyLink {
            fn characteristics(&self) -> Vec<btleplug::api::Characteristic> {
                Vec::new()
            }
            async fn read(
                &self,
                _: &btleplug::api::Characteristic,
            ) -> Result<Vec<u8>, btleplug::Error> {
                Ok(Vec::new())
            }
            async fn write(
                &self,
                _: &btleplug::api::Characteristic,
                _: &[u8],
                _: bool,
            ) -> Result<(), btleplug::Error> {
                Ok(())
            }
            async fn subscribe(
                &self,
                _: &btleplug::api::Characteristic,
            ) -> Result<(), btleplug::Error> {
                Ok(())
            }
            async fn unsubscribe(
                &self,
                _: &btleplug::api::Characteristic,
            ) -> Result<(), btleplug::Error> {
                Ok(())
            }
            async fn notifications(
                &self,
            ) -> Result<bluetooth::NotificationStream, btleplug::Error> {
                Ok(Box::pin(futures::stream::pending()))
            }
        }

        let (_tx, rx) = watch::channel(false);
        let desk = Desk::new(
            Arc::new(EmptyLink),
            PROTOCOL,
            test_config(Some(640), Some(1300)),
            rx,
        );

        let result = desk.get_height_speed().await;
        assert!(matches!(
            result,
            Err(DeskError::CharacteristicNotFound(uuid)) if uuid == PROTOCOL.reference_output
        ));
    }
}
