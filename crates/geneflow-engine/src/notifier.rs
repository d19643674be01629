//! Status-change notifications. A notification is a form-encoded POST
//! per recipient; failures are logged and never fail the run.

use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use geneflow_core::config::RemoteConfig;
use geneflow_core::definition::JobDef;
use geneflow_core::store::JobStatus;

#[derive(Debug, Serialize)]
struct NotificationMessage<'a> {
    to: &'a str,
    from: &'a str,
    subject: &'a str,
    content: &'a str,
}

const FROM_ADDRESS: &str = "geneflow@localhost";

/// POST a status-change message to every configured endpoint. When a
/// remote backend is active its bearer token rides along.
pub fn send_job_notifications(
    job: &JobDef,
    job_id: &str,
    status: JobStatus,
    bearer_token: Option<&str>,
    remote: &RemoteConfig,
) {
    if job.notifications.is_empty() {
        return;
    }

    let client = match reqwest::blocking::Client::builder()
        .connect_timeout(Duration::from_secs(remote.connect_timeout))
        .timeout(Duration::from_secs(remote.read_timeout))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            warn!(error = %err, "cannot build notification client");
            return;
        }
    };

    let subject = format!("GeneFlow Job \"{}\": {}", job.name, status);
    let content = format!(
        "Your GeneFlow job status has changed to {}\nJob Name: {}\nJob ID: {}",
        status, job.name, job_id
    );

    for notify in &job.notifications {
        for to in notify.to.as_vec() {
            info!(to = %to, url = %notify.url, "sending notification");
            let message = NotificationMessage {
                to: &to,
                from: FROM_ADDRESS,
                subject: &subject,
                content: &content,
            };
            let mut request = client.post(&notify.url).form(&message);
            if let Some(token) = bearer_token {
                request = request.bearer_auth(token);
            }
            match request.send() {
                Ok(response) if response.status().as_u16() == 201 => {}
                Ok(response) => {
                    warn!(
                        to = %to,
                        url = %notify.url,
                        status = %response.status(),
                        "cannot send notification"
                    );
                }
                Err(err) => {
                    warn!(to = %to, url = %notify.url, error = %err, "cannot send notification");
                }
            }
        }
    }
}
