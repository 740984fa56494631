use crate::types::{Status, WorkflowEvent, WorkflowJob};
use redis::{AsyncCommands, RedisResult};

/// Redis key semantics shared by the worker and the CLI.
/// Keys are deterministic so producers, the worker and any presentation layer
/// never drift.

pub const QUEUE_KEY: &str = "autocoder:queue:workflows";
pub const EVENTS_PREFIX: &str = "autocoder:events";
pub const STATUS_PREFIX: &str = "autocoder:status";
pub const CANCEL_PREFIX: &str = "autocoder:cancel";

/// Retention for event lists, status and cancel keys
const RETENTION_SECS: u64 = 86400;

/// Event list key for a workflow
pub fn events_key(workflow_id: &uuid::Uuid) -> String {
    format!("{}:{}", EVENTS_PREFIX, workflow_id)
}

/// Terminal status key for a workflow
pub fn status_key(workflow_id: &uuid::Uuid) -> String {
    format!("{}:{}", STATUS_PREFIX, workflow_id)
}

/// Cancellation flag key for a workflow
pub fn cancel_key(workflow_id: &uuid::Uuid) -> String {
    format!("{}:{}", CANCEL_PREFIX, workflow_id)
}

fn serialization_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
}

/// Push a workflow job to the queue (RPUSH, FIFO)
pub async fn push_job(
    conn: &mut redis::aio::ConnectionManager,
    job: &WorkflowJob,
) -> RedisResult<()> {
    let payload = serde_json::to_string(job).map_err(serialization_error)?;
    conn.rpush(QUEUE_KEY, payload).await
}

/// Pop a workflow job from the queue.
/// Uses BLPOP with timeout so the caller can observe shutdown.
pub async fn pop_job(
    conn: &mut redis::aio::ConnectionManager,
    timeout_seconds: f64,
) -> RedisResult<Option<WorkflowJob>> {
    let result: Option<(String, String)> = conn.blpop(QUEUE_KEY, timeout_seconds).await?;

    match result {
        Some((_key, payload)) => {
            let job: WorkflowJob = serde_json::from_str(&payload).map_err(serialization_error)?;
            Ok(Some(job))
        }
        None => Ok(None),
    }
}

/// Append one event to the workflow's mirrored event list
pub async fn append_event(
    conn: &mut redis::aio::ConnectionManager,
    workflow_id: &uuid::Uuid,
    event: &WorkflowEvent,
) -> RedisResult<()> {
    let key = events_key(workflow_id);
    let payload = serde_json::to_string(event).map_err(serialization_error)?;

    let _: () = conn.rpush(&key, payload).await?;
    let _: () = conn.expire(&key, RETENTION_SECS as i64).await?;
    Ok(())
}

/// Read mirrored events starting at index `from`
pub async fn read_events(
    conn: &mut redis::aio::ConnectionManager,
    workflow_id: &uuid::Uuid,
    from: usize,
) -> RedisResult<Vec<WorkflowEvent>> {
    let key = events_key(workflow_id);
    let payloads: Vec<String> = conn.lrange(&key, from as isize, -1).await?;

    payloads
        .iter()
        .map(|p| serde_json::from_str(p).map_err(serialization_error))
        .collect()
}

/// Store the terminal status of a workflow
pub async fn store_status(
    conn: &mut redis::aio::ConnectionManager,
    workflow_id: &uuid::Uuid,
    status: Status,
) -> RedisResult<()> {
    let key = status_key(workflow_id);
    let _: () = conn.set_ex(&key, status.as_str(), RETENTION_SECS).await?;
    Ok(())
}

/// Terminal status of a workflow, if it has finished
pub async fn get_status(
    conn: &mut redis::aio::ConnectionManager,
    workflow_id: &uuid::Uuid,
) -> RedisResult<Option<String>> {
    conn.get(status_key(workflow_id)).await
}

/// Flag a workflow for cancellation
pub async fn request_cancel(
    conn: &mut redis::aio::ConnectionManager,
    workflow_id: &uuid::Uuid,
) -> RedisResult<()> {
    let _: () = conn.set_ex(cancel_key(workflow_id), "1", RETENTION_SECS).await?;
    Ok(())
}

/// Whether cancellation was requested for a workflow
pub async fn is_cancelled(
    conn: &mut redis::aio::ConnectionManager,
    workflow_id: &uuid::Uuid,
) -> RedisResult<bool> {
    conn.exists(cancel_key(workflow_id)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_events_key_deterministic() {
        let id = Uuid::new_v4();
        let key1 = events_key(&id);
        let key2 = events_key(&id);
        assert_eq!(key1, key2);
        assert!(key1.starts_with("autocoder:events:"));
    }

    #[test]
    fn test_status_and_cancel_keys_are_distinct() {
        let id = Uuid::new_v4();
        let status = status_key(&id);
        let cancel = cancel_key(&id);
        assert_ne!(status, cancel);
        assert!(status.contains(&id.to_string()));
        assert!(cancel.starts_with("autocoder:cancel:"));
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_event_mirror_roundtrip() {
        let client = redis::Client::open(crate::config::redis_url()).unwrap();
        let mut conn = client.get_connection_manager().await.unwrap();
        let id = Uuid::new_v4();

        let first = WorkflowEvent::new(Status::Executing, 1);
        let second = WorkflowEvent::new(Status::Completed, 1);
        append_event(&mut conn, &id, &first).await.unwrap();
        append_event(&mut conn, &id, &second).await.unwrap();

        let tail = read_events(&mut conn, &id, 1).await.unwrap();
        assert_eq!(tail, vec![second]);
    }
}
