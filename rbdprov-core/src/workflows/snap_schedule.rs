//! Verification that a mirror snapshot schedule is producing snapshots.

use tracing::{debug, error, info, instrument};

use crate::binding::RbdBinding;
use crate::error::{OperationError, Result};
use crate::types::{parse_interval, ImageRef};

/// Number of schedule intervals to wait between the two status reads.
pub const SCHEDULE_WAIT_INTERVALS: u32 = 2;

/// Check that mirror snapshots of `image` change within two `interval`s.
///
/// Reads the mirror snapshot ids, sleeps, and reads them again; an unchanged
/// set means the schedule is not running.
#[instrument(skip(rbd, image), fields(image = %image))]
pub async fn verify_snapshot_schedule(rbd: &dyn RbdBinding, image: &ImageRef, interval: &str) -> Result<()> {
    let Some(every) = parse_interval(interval) else {
        error!(interval = %interval, "Invalid snapshot schedule interval");
        return Err(OperationError::InvalidConfig(format!(
            "invalid snapshot schedule interval '{}'",
            interval
        )));
    };

    let before = rbd.mirror_image_status(image).await.map_err(|e| {
        error!(error = %e, "Error fetching mirror image status");
        e
    })?;
    debug!(snapshot_ids = ?before.snapshot_ids, "Snapshot ids before interval");

    tokio::time::sleep(every * SCHEDULE_WAIT_INTERVALS).await;

    let after = rbd.mirror_image_status(image).await.map_err(|e| {
        error!(error = %e, "Error fetching mirror image status after interval");
        e
    })?;
    debug!(snapshot_ids = ?after.snapshot_ids, "Snapshot ids after interval");

    if before.snapshot_ids == after.snapshot_ids {
        error!(interval = %interval, "Snapshot schedule verification failed");
        return Err(OperationError::UnexpectedFailure(format!(
            "no new mirror snapshot of {} within {} x {}",
            image, SCHEDULE_WAIT_INTERVALS, interval
        )));
    }

    info!(interval = %interval, "Snapshot schedule verified");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{ImageCreate, MockRbd, PoolCreate};
    use crate::types::{MirrorMode, MirrorType, ScheduleScope};

    async fn snapshot_mirrored_image() -> (MockRbd, MockRbd, ImageRef) {
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
            features: None,
        })
        .await
        .unwrap();
        a.mirror_image_enable(&image, MirrorType::Snapshot).await.unwrap();
        (a, b, image)
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_produces_snapshots() {
        let (a, _b, image) = snapshot_mirrored_image().await;
        a.mirror_snapshot_schedule_add(&ScheduleScope::Image(image.clone()), "1m")
            .await
            .unwrap();
        verify_snapshot_schedule(&a, &image, "1m").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_schedule_fails() {
        let (a, _b, image) = snapshot_mirrored_image().await;
        let err = verify_snapshot_schedule(&a, &image, "1m").await.unwrap_err();
        assert!(matches!(err, OperationError::UnexpectedFailure(_)));
    }

    #[tokio::test]
    async fn test_invalid_interval() {
        let (a, _b, image) = snapshot_mirrored_image().await;
        assert!(matches!(
            verify_snapshot_schedule(&a, &image, "soon").await,
            Err(OperationError::InvalidConfig(_))
        ));
    }
}
