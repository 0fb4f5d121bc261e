use std::pin::Pin;
use std::sync::Arc;

use btleplug::api::Characteristic;
use futures::stream::{Stream, StreamExt};
use uuid::Uuid;

use super::bluetooth::DeskLink;
use super::DeskError;

/// Compare two UUID renderings the way peripherals print them: case folded,
/// separators stripped. Different BLE stacks disagree on both.
pub fn uuids_match(a: &str, b: &str) -> bool {
    fn normalize(s: &str) -> String {
        s.chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase()
    }
    normalize(a) == normalize(b)
}

/// Generic access to the discovered characteristic set: resolve by UUID,
/// then read/write/subscribe through the underlying link. Resolution
/// failures surface as [`DeskError::CharacteristicNotFound`]; everything
/// else propagates untouched. Retry policy belongs to the caller.
#[derive(Clone)]
pub struct GattAccessor {
    link: Arc<dyn DeskLink>,
    characteristics: Vec<Characteristic>,
}

impl GattAccessor {
    pub fn new(link: Arc<dyn DeskLink>) -> Self {
        let characteristics = link.characteristics();
        Self {
            link,
            characteristics,
        }
    }

    fn resolve(&self, uuid: Uuid) -> Result<&Characteristic, DeskError> {
        self.characteristics
            .iter()
            .find(|c| uuids_match(&c.uuid.to_string(), &uuid.to_string()))
            .ok_or(DeskError::CharacteristicNotFound(uuid))
    }

    pub async fn read(&self, uuid: Uuid) -> Result<Vec<u8>, DeskError> {
        let characteristic = self.resolve(uuid)?;
        Ok(self.link.read(characteristic).await?)
    }

    pub async fn write(
        &self,
        uuid: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), DeskError> {
        let characteristic = self.resolve(uuid)?;
        Ok(self.link.write(characteristic, data, with_response).await?)
    }

    pub async fn subscribe(&self, uuid: Uuid) -> Result<(), DeskError> {
        let characteristic = self.resolve(uuid)?;
        Ok(self.link.subscribe(characteristic).await?)
    }

    pub async fn unsubscribe(&self, uuid: Uuid) -> Result<(), DeskError> {
        let characteristic = self.resolve(uuid)?;
        Ok(self.link.unsubscribe(characteristic).await?)
    }

    pub async fn disconnect(&self) -> Result<(), DeskError> {
        Ok(self.link.disconnect().await?)
    }

    /// Stream of notification payloads for one characteristic. The stream
    /// ends when the link drops it; the caller owns cancellation.
    pub async fn notifications(
        &self,
        uuid: Uuid,
    ) -> Result<Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>, DeskError> {
        self.resolve(uuid)?;
        let stream = self.link.notifications().await?;
        Ok(Box::pin(stream.filter_map(move |notification| {
            futures::future::ready((notification.uuid == uuid).then_some(notification.value))
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_match_is_case_and_separator_insensitive() {
        assert!(uuids_match(
            "99FA0002-338A-1024-8A49-009C0215F78A",
            "99fa0002338a10248a49009c0215f78a"
        ));
        assert!(uuids_match(
            "99fa0002-338a-1024-8a49-009c0215f78a",
            "99fa0002-338a-1024-8a49-009c0215f78a"
        ));
        assert!(!uuids_match(
            "99fa0002-338a-1024-8a49-009c0215f78a",
            "99fa0021-338a-1024-8a49-009c0215f78a"
        ));
    }
}
