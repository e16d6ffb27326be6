//! Job commands.

use anyhow::Result;
use imagebuild_core::{JobId, JobQueue, JobStatus, payload_from_str};
use serde_json::{Value, json};

pub async fn enqueue(
    queue: &dyn JobQueue,
    job_type: &str,
    args: &str,
    dependencies: &[JobId],
    channel: &str,
) -> Result<()> {
    let args = payload_from_str(args)?;
    let id = queue.enqueue(job_type, args, dependencies, channel).await?;
    println!("{id}");
    Ok(())
}

pub async fn status(queue: &dyn JobQueue, id: JobId) -> Result<()> {
    let status = queue.job_status(id).await?;
    println!("{}", serde_json::to_string_pretty(&status_json(id, &status)?)?);
    Ok(())
}

pub async fn cancel(queue: &dyn JobQueue, id: JobId) -> Result<()> {
    queue.cancel_job(id).await?;
    println!("Canceled {id}");
    Ok(())
}

pub async fn list(queue: &dyn JobQueue, roots: bool) -> Result<()> {
    let ids = if roots {
        queue.all_root_job_ids().await?
    } else {
        queue.all_job_ids().await?
    };
    for id in ids {
        println!("{id}");
    }
    Ok(())
}

fn status_json(id: JobId, status: &JobStatus) -> Result<Value> {
    let result: Option<Value> = status.result_as()?;
    Ok(json!({
        "id": id,
        "type": status.job_type,
        "channel": status.channel,
        "state": status.state(),
        "queued_at": status.queued_at,
        "started_at": status.started_at,
        "finished_at": status.finished_at,
        "canceled": status.canceled,
        "dependencies": status.dependencies,
        "dependents": status.dependents,
        "result": result,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use imagebuild_core::JobRecord;

    #[test]
    fn test_status_json_shape() {
        let dep = JobId::new();
        let mut job = JobRecord::new("osbuild", payload_from_str("{}").unwrap(), vec![dep], "");
        job.finish(Some(payload_from_str(r#"{"ok":true}"#).unwrap()));
        let status = job.status(vec![]);

        let value = status_json(job.id, &status).unwrap();
        assert_eq!(value["type"], "osbuild");
        assert_eq!(value["state"], "finished");
        assert_eq!(value["dependencies"][0], dep.to_string());
        assert_eq!(value["result"]["ok"], true);
        assert!(value["started_at"].is_null());
    }
}
