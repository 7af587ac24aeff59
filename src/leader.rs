//! Lease-based leader election.
//!
//! One coordination/v1 Lease guards the controller loops: the binary
//! blocks until it holds the lease, then renews it in the background for
//! as long as the process lives. A crashed leader is replaced once its
//! lease duration elapses.

use std::time::Duration;

use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, PostParams};
use kube::core::ObjectMeta;
use kube::{Client, Error as KubeError};
use tracing::{debug, info, warn};

use crate::controllers::types::Result;

const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEWAL_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

pub struct LeaderLock {
    client: Client,
    namespace: String,
    lease_name: String,
    holder: String,
}

impl LeaderLock {
    #[must_use]
    pub fn new(client: Client, namespace: &str, lease_name: &str, holder: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            lease_name: lease_name.to_string(),
            holder: holder.to_string(),
        }
    }

    /// Block until this process holds the lease, then keep renewing it in a
    /// background task.
    pub async fn acquire_and_hold(&self) -> Result<()> {
        loop {
            match self.try_acquire().await {
                Ok(()) => break,
                Err(holder) => {
                    debug!(lease = %self.lease_name, holder = %holder, "Lease held elsewhere, waiting");
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        }

        info!(lease = %self.lease_name, holder = %self.holder, "Acquired leadership");

        let leases: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let lease_name = self.lease_name.clone();
        let holder = self.holder.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(RENEWAL_INTERVAL).await;
                if let Err(e) = renew(&leases, &lease_name, &holder).await {
                    warn!(lease = %lease_name, "Lease renewal failed: {e}");
                }
            }
        });

        Ok(())
    }

    /// One acquisition attempt. On contention returns the current holder.
    async fn try_acquire(&self) -> std::result::Result<(), String> {
        let leases: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let lease = self.lease_object();

        match leases.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(()),
            Err(KubeError::Api(ae)) if ae.code == 409 => {
                let existing = leases
                    .get(&self.lease_name)
                    .await
                    .map_err(|e| e.to_string())?;

                let current_holder = existing
                    .spec
                    .as_ref()
                    .and_then(|s| s.holder_identity.clone())
                    .unwrap_or_else(|| "unknown".to_string());

                if current_holder == self.holder || is_expired(&existing) {
                    let mut updated = existing;
                    updated.spec = Some(self.lease_spec());
                    leases
                        .replace(&self.lease_name, &PostParams::default(), &updated)
                        .await
                        .map_err(|e| e.to_string())?;
                    Ok(())
                } else {
                    Err(current_holder)
                }
            }
            Err(e) => Err(e.to_string()),
        }
    }

    fn lease_object(&self) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(self.lease_spec()),
        }
    }

    fn lease_spec(&self) -> LeaseSpec {
        let now = chrono::Utc::now();
        LeaseSpec {
            holder_identity: Some(self.holder.clone()),
            lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            ..Default::default()
        }
    }
}

fn is_expired(lease: &Lease) -> bool {
    let Some(spec) = &lease.spec else { return true };
    let Some(renew_time) = &spec.renew_time else {
        return true;
    };
    let Some(duration_seconds) = spec.lease_duration_seconds else {
        return true;
    };

    renew_time.0 + chrono::Duration::seconds(i64::from(duration_seconds)) < chrono::Utc::now()
}

async fn renew(leases: &Api<Lease>, lease_name: &str, holder: &str) -> Result<()> {
    let mut lease = leases.get(lease_name).await?;
    let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
    spec.holder_identity = Some(holder.to_string());
    spec.renew_time = Some(MicroTime(chrono::Utc::now()));
    leases
        .replace(lease_name, &PostParams::default(), &lease)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease_with(renewed_secs_ago: i64, duration: i32) -> Lease {
        Lease {
            metadata: ObjectMeta::default(),
            spec: Some(LeaseSpec {
                holder_identity: Some("other".to_string()),
                lease_duration_seconds: Some(duration),
                renew_time: Some(MicroTime(
                    chrono::Utc::now() - chrono::Duration::seconds(renewed_secs_ago),
                )),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn fresh_lease_is_not_expired() {
        assert!(!is_expired(&lease_with(5, 30)));
    }

    #[test]
    fn stale_lease_is_expired() {
        assert!(is_expired(&lease_with(60, 30)));
    }

    #[test]
    fn lease_without_spec_is_expired() {
        let lease = Lease {
            metadata: ObjectMeta::default(),
            spec: None,
        };
        assert!(is_expired(&lease));
    }
}
