//! Replay delay of journal based mirroring.
//!
//! A delay can be set per image (image-meta on the primary) or for every
//! image replayed by the secondary's `client` (cluster config on the
//! secondary). [`verify_mirroring_delay`] writes to the primary and checks
//! that the secondary stays behind for at least the delay.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::binding::RbdBinding;
use crate::error::{OperationError, Result};
use crate::types::{ImageRef, REPLAY_DELAY_CONFIG_KEY, REPLAY_DELAY_META_KEY};
use crate::wait::{wait_until, WaitPolicy};

/// Config section the client scoped delay is set for.
pub const DELAY_CLIENT: &str = "client";

/// Where a replay delay is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelayScope {
    /// One image; set on the primary cluster.
    Image(ImageRef),
    /// Every image replayed by the client; set on the secondary cluster.
    Client,
}

/// Set the replay delay for `scope` and read it back.
#[instrument(skip(rbd, scope), fields(scope = ?scope, delay_secs = delay.as_secs()))]
pub async fn configure_mirroring_delay(rbd: &dyn RbdBinding, scope: &DelayScope, delay: Duration) -> Result<()> {
    let value = delay.as_secs().to_string();

    let (set, get) = match scope {
        DelayScope::Image(image) => (
            rbd.image_meta_set(image, REPLAY_DELAY_META_KEY, &value).await?,
            rbd.image_meta_get(image, REPLAY_DELAY_META_KEY).await?,
        ),
        DelayScope::Client => (
            rbd.config_set(DELAY_CLIENT, REPLAY_DELAY_CONFIG_KEY, &value).await?,
            rbd.config_get(DELAY_CLIENT, REPLAY_DELAY_CONFIG_KEY).await?,
        ),
    };

    if set.has_err() {
        error!(stderr = %set.stderr.trim(), "Setting replay delay failed");
        return Err(OperationError::UnexpectedFailure(format!(
            "setting replay delay for {:?} failed: {}",
            scope,
            set.stderr.trim()
        )));
    }
    if get.stdout.trim() != value {
        error!(expected = %value, actual = %get.stdout.trim(), "Replay delay not applied");
        return Err(OperationError::UnexpectedFailure(format!(
            "replay delay for {:?} reads back as '{}', expected '{}'",
            scope,
            get.stdout.trim(),
            value
        )));
    }

    info!("Replay delay configured");
    Ok(())
}

/// Write `io_total` to the primary image and check the secondary lags by `delay`.
///
/// The secondary must report entries behind the primary right after the
/// write (else `UnexpectedSuccess`), and must not catch up before `delay`
/// has elapsed.
#[instrument(skip(primary, secondary, image, wait), fields(image = %image, delay_secs = delay.as_secs()))]
pub async fn verify_mirroring_delay(
    primary: &dyn RbdBinding,
    secondary: &dyn RbdBinding,
    image: &ImageRef,
    delay: Duration,
    io_total: &str,
    wait: WaitPolicy,
) -> Result<()> {
    let start = Instant::now();
    let out = primary.bench_write(image, io_total, None).await?;
    if out.has_err() || !out.exit_ok() {
        error!(stderr = %out.stderr.trim(), "Write to primary image failed");
        return Err(OperationError::UnexpectedFailure(format!(
            "write to {} failed: {}",
            image,
            out.stderr.trim()
        )));
    }

    let status = secondary.mirror_image_status(image).await?;
    match status.entries_behind_primary() {
        None => {
            error!(description = %status.description, "No replay position in mirror status");
            return Err(OperationError::ParseFailed(format!(
                "no entries_behind_primary in status of {}: {}",
                image, status.description
            )));
        }
        Some(0) => {
            error!("Secondary replayed the write without delay");
            return Err(OperationError::UnexpectedSuccess(format!(
                "{} is not behind primary right after the write",
                image
            )));
        }
        Some(behind) => info!(entries_behind = behind, "Secondary is behind primary"),
    }

    let what = format!("{} to catch up with primary", image);
    wait_until(wait, &what, move || async move {
        secondary
            .mirror_image_status(image)
            .await
            .map(|status| status.entries_behind_primary() == Some(0))
    })
    .await?;

    let elapsed = start.elapsed();
    if elapsed < delay {
        warn!(elapsed_secs = elapsed.as_secs(), "Replay finished before delay");
        return Err(OperationError::UnexpectedFailure(format!(
            "{} caught up after {}s, before the {}s delay",
            image,
            elapsed.as_secs(),
            delay.as_secs()
        )));
    }

    info!(elapsed_secs = elapsed.as_secs(), "Replay delay verified");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{ImageCreate, MockRbd, PoolCreate};
    use crate::config::JOURNAL_IMAGE_FEATURES;
    use crate::types::{MirrorMode, MirrorType};

    async fn journal_mirrored_image() -> (MockRbd, MockRbd, ImageRef) {
        let (a, b) = MockRbd::pair("site-a", "site-b");
        for rbd in [&a, &b] {
            rbd.pool_create(&PoolCreate::replicated("p")).await.unwrap();
            rbd.mirror_pool_enable("p", MirrorMode::Image).await.unwrap();
        }
        let image = ImageRef::new("p", "i");
        a.image_create(&ImageCreate {
            image: image.clone(),
            size: "1G".to_string(),
            data_pool: None,
            features: Some(JOURNAL_IMAGE_FEATURES.to_string()),
        })
        .await
        .unwrap();
        let out = a.mirror_image_enable(&image, MirrorType::Journal).await.unwrap();
        assert!(out.exit_ok());
        (a, b, image)
    }

    fn policy() -> WaitPolicy {
        WaitPolicy::new(Duration::from_secs(600), Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_image_scoped_delay() {
        let (a, b, image) = journal_mirrored_image().await;
        let delay = Duration::from_secs(120);
        configure_mirroring_delay(&a, &DelayScope::Image(image.clone()), delay)
            .await
            .unwrap();
        verify_mirroring_delay(&a, &b, &image, delay, "10M", policy())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_scoped_delay() {
        let (a, b, image) = journal_mirrored_image().await;
        let delay = Duration::from_secs(60);
        configure_mirroring_delay(&b, &DelayScope::Client, delay).await.unwrap();
        verify_mirroring_delay(&a, &b, &image, delay, "10M", policy())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_delay_is_unexpected_success() {
        let (a, b, image) = journal_mirrored_image().await;
        let err = verify_mirroring_delay(&a, &b, &image, Duration::from_secs(60), "10M", policy())
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::UnexpectedSuccess(_)));
    }

    #[tokio::test]
    async fn test_image_delay_cannot_be_set_on_replica() {
        let (_a, b, image) = journal_mirrored_image().await;
        let err = configure_mirroring_delay(&b, &DelayScope::Image(image), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::UnexpectedFailure(ref m) if m.contains("Read-only")));
    }
}
