//! Timestamp matching of raw frame buffers against metadata buffers.

use std::collections::VecDeque;

use tracing::debug;

use crate::controls::ControlList;

use super::stream::FrameBuffer;

/// A dequeued raw frame awaiting a pipeline cycle: the buffer, the sensor
/// controls in effect for that frame, and the delay-context index aligning
/// those controls with the frame they were applied to.
#[derive(Debug)]
pub struct BayerFrame {
    pub buffer: FrameBuffer,
    pub controls: ControlList,
    pub delay_context: u32,
}

/// A raw frame ready to start a cycle, with its matched metadata buffer when
/// one exists.
#[derive(Debug)]
pub struct MatchedFrame {
    pub bayer: BayerFrame,
    pub metadata: Option<FrameBuffer>,
}

/// Make exactly one match attempt between the front raw frame and the
/// metadata queue.
///
/// Metadata strictly older than the front raw frame is stale; it is drained
/// into `dropped` for the caller to hand back to its device queue. The scan
/// stops at an exact match, at the first newer metadata buffer (no match yet;
/// retried on the next raw-frame arrival), or when the metadata queue runs
/// dry. With the metadata queue empty the outcome depends on the sensor:
/// `sensor_metadata` set means wait for the buffer still in flight, unset
/// means the frame legitimately proceeds unmatched.
pub fn find_matching_buffers(
    bayer_queue: &mut VecDeque<BayerFrame>,
    metadata_queue: &mut VecDeque<FrameBuffer>,
    sensor_metadata: bool,
    dropped: &mut Vec<FrameBuffer>,
) -> Option<MatchedFrame> {
    let front = bayer_queue.front()?;
    let ts = front.buffer.timestamp_ns;

    let mut metadata = None;
    while let Some(candidate) = metadata_queue.front() {
        if candidate.timestamp_ns < ts {
            let stale = metadata_queue.pop_front().expect("front checked above");
            debug!(
                timestamp_ns = stale.timestamp_ns,
                "dropping unmatched metadata buffer"
            );
            metrics::counter!("prism_metadata_dropped_total").increment(1);
            dropped.push(stale);
        } else if candidate.timestamp_ns == ts {
            metadata = metadata_queue.pop_front();
            break;
        } else {
            // Only newer timestamps from here.
            break;
        }
    }

    if metadata.is_none() && sensor_metadata {
        if metadata_queue.is_empty() {
            // Dequeue ordering may deliver the image buffer first; wait for
            // the metadata buffer still in flight.
            debug!("waiting for next metadata buffer");
            return None;
        }

        debug!("returning raw frame without a matching metadata buffer");
    }

    let bayer = bayer_queue.pop_front().expect("front checked above");
    Some(MatchedFrame { bayer, metadata })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bayer(timestamp_ns: u64) -> BayerFrame {
        BayerFrame {
            buffer: FrameBuffer::new(0, 0, timestamp_ns),
            controls: ControlList::new(),
            delay_context: 0,
        }
    }

    fn meta(index: u16, timestamp_ns: u64) -> FrameBuffer {
        FrameBuffer::new(index, 0, timestamp_ns)
    }

    #[test]
    fn drops_stale_and_matches_in_order() {
        let mut bayer_queue: VecDeque<_> = [bayer(10), bayer(20)].into();
        let mut metadata_queue: VecDeque<_> = [meta(0, 5), meta(1, 10), meta(2, 20)].into();
        let mut dropped = Vec::new();

        let first =
            find_matching_buffers(&mut bayer_queue, &mut metadata_queue, true, &mut dropped)
                .expect("first match");
        assert_eq!(first.bayer.buffer.timestamp_ns, 10);
        assert_eq!(first.metadata.unwrap().timestamp_ns, 10);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].timestamp_ns, 5);

        let second =
            find_matching_buffers(&mut bayer_queue, &mut metadata_queue, true, &mut dropped)
                .expect("second match");
        assert_eq!(second.bayer.buffer.timestamp_ns, 20);
        assert_eq!(second.metadata.unwrap().timestamp_ns, 20);

        assert!(bayer_queue.is_empty());
        assert!(metadata_queue.is_empty());
        assert_eq!(dropped.len(), 1, "no double matches, no extra drops");
    }

    #[test]
    fn newer_metadata_stops_the_scan() {
        let mut bayer_queue: VecDeque<_> = [bayer(10)].into();
        let mut metadata_queue: VecDeque<_> = [meta(0, 15)].into();
        let mut dropped = Vec::new();

        let matched =
            find_matching_buffers(&mut bayer_queue, &mut metadata_queue, true, &mut dropped)
                .expect("frame proceeds without metadata");
        assert!(matched.metadata.is_none());
        assert_eq!(metadata_queue.len(), 1, "newer buffer left for later");
        assert!(dropped.is_empty());
    }

    #[test]
    fn empty_metadata_queue_waits_when_sensor_produces_metadata() {
        let mut bayer_queue: VecDeque<_> = [bayer(10)].into();
        let mut metadata_queue = VecDeque::new();
        let mut dropped = Vec::new();

        assert!(
            find_matching_buffers(&mut bayer_queue, &mut metadata_queue, true, &mut dropped)
                .is_none()
        );
        assert_eq!(bayer_queue.len(), 1, "raw frame stays queued");
    }

    #[test]
    fn no_sensor_metadata_proceeds_unmatched() {
        let mut bayer_queue: VecDeque<_> = [bayer(10)].into();
        let mut metadata_queue = VecDeque::new();
        let mut dropped = Vec::new();

        let matched =
            find_matching_buffers(&mut bayer_queue, &mut metadata_queue, false, &mut dropped)
                .expect("match without metadata");
        assert!(matched.metadata.is_none());
    }

    #[test]
    fn empty_raw_queue_never_matches() {
        let mut bayer_queue = VecDeque::new();
        let mut metadata_queue: VecDeque<_> = [meta(0, 10)].into();
        let mut dropped = Vec::new();

        assert!(
            find_matching_buffers(&mut bayer_queue, &mut metadata_queue, true, &mut dropped)
                .is_none()
        );
        assert_eq!(metadata_queue.len(), 1);
    }
}
