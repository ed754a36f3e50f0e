//! Media room provisioning collaborator.

use async_trait::async_trait;
use log::debug;
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::calls::{CallId, MediaType, ParticipantRole};

/// Joinable credentials for a provisioned room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomGrant {
    pub meeting_id: String,
    pub attendee_id: String,
    pub join_token: String,
}

/// Who is asking for a room, and for which call.
#[derive(Debug, Clone)]
pub struct RoomRequest {
    pub call_id: CallId,
    pub user_id: String,
    pub role: ParticipantRole,
    pub media_type: MediaType,
}

/// Creates media rooms and adds attendees.
///
/// Calls may be dropped mid-flight when the call they belong to is
/// superseded; implementations must tolerate being cancelled.
#[async_trait]
pub trait RoomProvisioner: Send + Sync {
    /// Creates a room and adds the requester as its first attendee.
    async fn create_room(&self, request: &RoomRequest) -> Result<RoomGrant, anyhow::Error>;

    /// Adds the requester to an existing room.
    async fn join_room(
        &self,
        meeting_id: &str,
        request: &RoomRequest,
    ) -> Result<RoomGrant, anyhow::Error>;
}

/// Provisioner that keeps rooms in memory. Used by the demo binary and tests.
#[derive(Default)]
pub struct LocalRoomProvisioner {
    rooms: Mutex<HashMap<String, Vec<String>>>,
    latency: Duration,
    failure: Option<String>,
}

impl LocalRoomProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request takes `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every request fails with `message`.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    pub async fn attendees(&self, meeting_id: &str) -> Vec<String> {
        self.rooms
            .lock()
            .await
            .get(meeting_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn simulate(&self) -> Result<(), anyhow::Error> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match &self.failure {
            Some(message) => Err(anyhow::anyhow!(message.clone())),
            None => Ok(()),
        }
    }

    fn grant(meeting_id: &str, user_id: &str) -> RoomGrant {
        let join_token = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        RoomGrant {
            meeting_id: meeting_id.to_string(),
            attendee_id: format!("{meeting_id}/{user_id}"),
            join_token,
        }
    }
}

#[async_trait]
impl RoomProvisioner for LocalRoomProvisioner {
    async fn create_room(&self, request: &RoomRequest) -> Result<RoomGrant, anyhow::Error> {
        self.simulate().await?;
        let meeting_id = format!("room-{}", request.call_id);
        self.rooms
            .lock()
            .await
            .insert(meeting_id.clone(), vec![request.user_id.clone()]);
        debug!(target: "Provisioning", "Created {meeting_id} for {}", request.user_id);
        Ok(Self::grant(&meeting_id, &request.user_id))
    }

    async fn join_room(
        &self,
        meeting_id: &str,
        request: &RoomRequest,
    ) -> Result<RoomGrant, anyhow::Error> {
        self.simulate().await?;
        let mut rooms = self.rooms.lock().await;
        let attendees = rooms
            .get_mut(meeting_id)
            .ok_or_else(|| anyhow::anyhow!("meeting {meeting_id} does not exist"))?;
        attendees.push(request.user_id.clone());
        debug!(target: "Provisioning", "{} joined {meeting_id}", request.user_id);
        Ok(Self::grant(meeting_id, &request.user_id))
    }
}
