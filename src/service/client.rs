//! Read-only consumer of published datasets.

use crate::domain::dataset::{decode_envelope, TrackedDataset};
use crate::domain::datasets::corporate_actions::{self, CorporateActions};
use crate::domain::error::TidemarkError;
use crate::domain::object_id::ObjectId;
use crate::domain::range::TimeRange;
use crate::ports::registry_port::{ObjectRegistry, RegistryConnection};
use std::time::Duration;
use tracing::debug;

/// One published object as seen by a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedObject {
    pub identity: String,
    pub object_id: ObjectId,
    pub data_size: u64,
}

pub struct DataClient {
    conn: Box<dyn RegistryConnection>,
    timeout: Duration,
}

impl DataClient {
    pub fn connect(registry: &dyn ObjectRegistry) -> Result<Self, TidemarkError> {
        Ok(Self {
            conn: registry.connect()?,
            timeout: Duration::ZERO,
        })
    }

    /// How long reads wait for an object that is not there yet.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn get_raw(&mut self, identity: &str) -> Result<Option<Vec<u8>>, TidemarkError> {
        let id = ObjectId::from_identity(identity);
        self.conn.get(&id, self.timeout)
    }

    /// The published value of `dataset`, or `None` if nothing is published.
    pub fn get<D: TrackedDataset>(&mut self, dataset: &D) -> Result<Option<D::Value>, TidemarkError> {
        let identity = &dataset.meta().identity;
        match self.get_raw(identity)? {
            Some(bytes) => {
                debug!(dataset = %identity, bytes = bytes.len(), "read published value");
                dataset.deserialize(&bytes).map(Some)
            }
            None => Ok(None),
        }
    }

    pub fn contains(&mut self, identity: &str) -> Result<bool, TidemarkError> {
        self.conn.contains(&ObjectId::from_identity(identity))
    }

    pub fn list(&mut self) -> Result<Vec<PublishedObject>, TidemarkError> {
        Ok(self
            .conn
            .list()?
            .into_iter()
            .map(|(object_id, info)| PublishedObject {
                identity: object_id.identity(),
                object_id,
                data_size: info.data_size,
            })
            .collect())
    }

    pub fn capacity(&mut self) -> Result<u64, TidemarkError> {
        self.conn.capacity()
    }

    /// Corporate actions published under `identity`, clipped to `range`.
    pub fn corporate_actions(
        &mut self,
        identity: &str,
        range: TimeRange,
    ) -> Result<Option<CorporateActions>, TidemarkError> {
        let Some(bytes) = self.get_raw(identity)? else {
            return Ok(None);
        };
        let actions: CorporateActions = decode_envelope(corporate_actions::KIND, &bytes)?;
        Ok(Some(actions.between(range)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_registry::MemoryRegistry;
    use crate::domain::dataset::encode_envelope;
    use crate::domain::frame::{Frame, Row};
    use chrono::NaiveDate;

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, day).unwrap()
    }

    fn publish(registry: &MemoryRegistry, identity: &str, bytes: &[u8]) {
        registry
            .connect()
            .unwrap()
            .put(bytes, &ObjectId::from_identity(identity))
            .unwrap();
    }

    #[test]
    fn list_recovers_identities() {
        let registry = MemoryRegistry::new(1024);
        publish(&registry, "bars", b"abc");
        publish(&registry, "actions", b"de");
        let mut client = DataClient::connect(&registry).unwrap();

        let mut listed: Vec<(String, u64)> = client
            .list()
            .unwrap()
            .into_iter()
            .map(|o| (o.identity, o.data_size))
            .collect();
        listed.sort();
        assert_eq!(listed, vec![("actions".into(), 2), ("bars".into(), 3)]);
        assert!(client.contains("bars").unwrap());
        assert!(!client.contains("ghost").unwrap());
        assert_eq!(client.capacity().unwrap(), 1024);
    }

    #[test]
    fn corporate_actions_are_clipped() {
        let range = TimeRange::new(d(1, 1), d(3, 31)).unwrap();
        let dividends = Frame::from_rows(
            vec!["per_cash_div".into()],
            vec![
                Row {
                    date: d(1, 15),
                    entity: "AAA".into(),
                    values: vec!["0.5".into()],
                },
                Row {
                    date: d(3, 15),
                    entity: "BBB".into(),
                    values: vec!["1.0".into()],
                },
            ],
        )
        .unwrap();
        let allotments = Frame::new(vec![]);
        let actions = CorporateActions::from_frames(range, &dividends, &allotments).unwrap();

        let registry = MemoryRegistry::new(1 << 16);
        publish(
            &registry,
            "actions",
            &encode_envelope(corporate_actions::KIND, &actions).unwrap(),
        );

        let mut client = DataClient::connect(&registry).unwrap();
        let march = TimeRange::new(d(3, 1), d(3, 31)).unwrap();
        let clipped = client.corporate_actions("actions", march).unwrap().unwrap();
        assert_eq!(clipped.ex_dates().collect::<Vec<_>>(), vec![d(3, 15)]);
        assert!(client.corporate_actions("missing", march).unwrap().is_none());
    }

    #[test]
    fn wrong_kind_is_integrity_error() {
        let registry = MemoryRegistry::new(1024);
        publish(&registry, "bars", &encode_envelope("table_series", &1).unwrap());
        let mut client = DataClient::connect(&registry).unwrap();
        let range = TimeRange::new(d(1, 1), d(1, 2)).unwrap();
        assert!(matches!(
            client.corporate_actions("bars", range),
            Err(TidemarkError::Integrity { .. })
        ));
    }
}
