//! Operator actions on stored alarms.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{Alarm, AlarmAction, Envelope, OperatorContext, PipelineError, PushHub, Store};

// ---

#[derive(Clone)]
pub struct AlarmActions {
    store: Arc<dyn Store>,
    push: PushHub,
}

impl AlarmActions {
    // ---
    pub fn new(store: Arc<dyn Store>, push: PushHub) -> Self {
        Self { store, push }
    }

    /// Apply `action` to alarm `id` on behalf of `operator`.
    ///
    /// The update is conditional on the status read here, so two operators
    /// racing on one alarm cannot both win: the loser gets
    /// [`PipelineError::Conflict`].
    pub async fn apply(
        &self,
        id: Uuid,
        action: AlarmAction,
        operator: &OperatorContext,
        remark: Option<String>,
    ) -> Result<Alarm, PipelineError> {
        // ---
        let mut alarm = self
            .store
            .get_alarm(id)
            .await
            .map_err(PipelineError::storage)?
            .ok_or_else(|| PipelineError::NotFound(format!("alarm {id}")))?;

        let expected = alarm.status;
        alarm.apply(action, &operator.username, Utc::now(), remark)?;

        let updated = self
            .store
            .update_alarm(&alarm, expected)
            .await
            .map_err(PipelineError::storage)?;
        if !updated {
            return Err(PipelineError::Conflict(format!(
                "alarm {id} changed while applying {action}"
            )));
        }

        info!(
            alarm_id = %id,
            site_id = alarm.site_id,
            operator = %operator.username,
            user_id = operator.user_id,
            "alarm {action} applied, now {}",
            alarm.status
        );

        match Envelope::alarm(&alarm) {
            Ok(envelope) => {
                self.push.publish(alarm.site_id, envelope);
            }
            Err(e) => warn!(alarm_id = %id, "could not encode alarm update: {e}"),
        }
        Ok(alarm)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{evaluate, AlarmStatus, AlarmThresholds, EventKind, MemoryStore, Reading};

    fn create_test_operator(name: &str) -> OperatorContext {
        OperatorContext {
            user_id: 1,
            username: name.to_string(),
            role: "ADMIN".to_string(),
        }
    }

    async fn setup() -> (Arc<MemoryStore>, PushHub, AlarmActions, Alarm) {
        // ---
        let store = Arc::new(MemoryStore::new());
        let push = PushHub::new(16);
        let actions = AlarmActions::new(store.clone(), push.clone());

        let reading = Reading {
            site_id: 3,
            site_name: None,
            temperature: Some(40.0),
            humidity: None,
            pm25: None,
            illuminance: None,
            co2: None,
            online_device_count: None,
            total_device_count: None,
            occupancy: None,
            timestamp: Utc::now(),
            source: "SENSOR".to_string(),
            alarm_status: None,
            remark: None,
        };
        let alarm = evaluate(&reading, &AlarmThresholds::default()).remove(0);
        store.insert_alarm(&alarm).await.unwrap();
        (store, push, actions, alarm)
    }

    #[tokio::test]
    async fn test_confirm_then_resolve_records_operators_and_pushes() {
        // ---
        let (store, push, actions, alarm) = setup().await;
        let mut viewer = push.subscribe(3);

        actions
            .apply(alarm.id, AlarmAction::Confirm, &create_test_operator("anna"), None)
            .await
            .unwrap();
        let resolved = actions
            .apply(
                alarm.id,
                AlarmAction::Resolve,
                &create_test_operator("li"),
                Some("hvac reset".into()),
            )
            .await
            .unwrap();

        assert_eq!(resolved.status, AlarmStatus::Resolved);
        let stored = store.get_alarm(alarm.id).await.unwrap().unwrap();
        assert_eq!(stored.confirmed_by.as_deref(), Some("anna"));
        assert_eq!(stored.resolved_by.as_deref(), Some("li"));
        assert_eq!(stored.remark.as_deref(), Some("hvac reset"));

        let first = viewer.try_recv().unwrap();
        assert_eq!(first.kind, EventKind::Alarm);
        assert_eq!(first.payload["status"], "CONFIRMED");
        assert_eq!(viewer.try_recv().unwrap().payload["status"], "RESOLVED");
    }

    #[tokio::test]
    async fn test_terminal_alarm_rejects_further_actions() {
        // ---
        let (store, _push, actions, alarm) = setup().await;
        actions
            .apply(alarm.id, AlarmAction::Ignore, &create_test_operator("anna"), None)
            .await
            .unwrap();

        let err = actions
            .apply(alarm.id, AlarmAction::Confirm, &create_test_operator("li"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Transition(_)));
        let stored = store.get_alarm(alarm.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AlarmStatus::Ignored);
        assert!(stored.confirmed_by.is_none());
    }

    #[tokio::test]
    async fn test_unknown_alarm_is_not_found() {
        // ---
        let (_store, _push, actions, _alarm) = setup().await;
        let err = actions
            .apply(Uuid::new_v4(), AlarmAction::Confirm, &create_test_operator("anna"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }
}
