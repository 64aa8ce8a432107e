use super::engine::Engine;
use super::{JobHandle, RawSegment};
use crate::kernel::audio::segment::{AudioFormat, SegmentDescriptor, SegmentReadyState};

/// Turns per-job segment lists into globally indexed descriptors.
///
/// Job k's segments are numbered after every segment of jobs 0..k. A job's
/// offset is only known once all earlier jobs have a final segment count,
/// so indices, once handed out, never move. Jobs behind a job with an
/// unsettled count are held back until it settles.
pub fn assign_indices(engine: Engine, jobs: &[JobHandle]) -> Vec<SegmentDescriptor> {
    let mut out = Vec::new();
    let mut offset = 0usize;

    for job in jobs {
        let mut segments: Vec<&RawSegment> = job.segments.iter().collect();
        segments.sort_by_key(|s| s.index.unwrap_or(usize::MAX));

        if let Some(per_job) = engine.segments_per_job() {
            for (position, raw) in segments.iter().take(per_job).enumerate() {
                out.push(descriptor(engine, job, raw, offset + position));
            }
            if job.state.is_terminal() {
                // Nothing more will arrive for the slots this job left empty.
                for position in segments.len().min(per_job)..per_job {
                    out.push(placeholder(job, offset + position));
                }
            }
            offset += per_job;
            continue;
        }

        for (position, raw) in segments.iter().enumerate() {
            out.push(descriptor(engine, job, raw, offset + position));
        }
        if !job.state.is_terminal() {
            break;
        }
        offset += segments.len();
    }
    out
}

fn descriptor(engine: Engine, job: &JobHandle, raw: &RawSegment, index: usize) -> SegmentDescriptor {
    let mut state = engine.segment_state(&raw.status);
    if state == SegmentReadyState::Ready && raw.url.is_empty() {
        state = SegmentReadyState::Queued;
    }
    // A finished job will not update this segment again.
    if state == SegmentReadyState::Queued && job.state.is_terminal() {
        state = SegmentReadyState::Failed;
    }
    SegmentDescriptor {
        index,
        segment_id: raw.id.clone(),
        job_id: job.job_id.clone(),
        state,
        fetch_url: raw.url.clone(),
        format: raw
            .format
            .as_deref()
            .and_then(AudioFormat::from_hint)
            .or(Some(engine.default_format())),
    }
}

fn placeholder(job: &JobHandle, index: usize) -> SegmentDescriptor {
    SegmentDescriptor {
        index,
        segment_id: format!("{}-missing-{}", job.job_id, index),
        job_id: job.job_id.clone(),
        state: SegmentReadyState::Failed,
        fetch_url: String::new(),
        format: None,
    }
}
