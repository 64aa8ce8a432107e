mod common;

use common::FakeBackend;
use narrator::kernel::audio::segment::{AudioFormat, JobId, SegmentReadyState};
use narrator::kernel::event::Event;
use narrator::services::synthesis::chunker::chunk_text;
use narrator::services::synthesis::http::resolve_url;
use narrator::services::synthesis::indexer::assign_indices;
use narrator::services::synthesis::poller::{run_poll_loop, PollSettings};
use narrator::services::synthesis::{
    combine_states, CancelRoute, Engine, JobHandle, JobState, RawJobStatus, RawSegment,
    SynthesisClient, SynthesisError, SynthesisOptions,
};
use reqwest::Url;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn raw(id: &str, index: usize, status: &str, url: &str) -> RawSegment {
    RawSegment {
        id: id.to_string(),
        index: Some(index),
        status: status.to_string(),
        url: url.to_string(),
        format: None,
    }
}

fn job(id: &str, ordinal: usize, state: JobState, segments: Vec<RawSegment>) -> JobHandle {
    JobHandle {
        job_id: JobId::new(id),
        ordinal,
        state,
        segments,
        error: None,
    }
}

/// Several paragraphs, each well under but together well over Bark's bound.
fn long_text() -> String {
    (0..6)
        .map(|p| format!("Paragraph {} opens here. {}", p, "The rain kept falling. ".repeat(8)))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[test]
fn test_combined_status_precedence() {
    use JobState::*;
    assert_eq!(combine_states([Complete, Error, Processing]), Error);
    assert_eq!(combine_states([Complete, Canceled, Processing]), Canceled);
    assert_eq!(combine_states([Complete, Queued]), Processing);
    assert_eq!(combine_states([Complete, Complete]), Complete);
    assert_eq!(combine_states(Vec::<JobState>::new()), Complete);
}

#[test]
fn test_engine_vocabularies() {
    assert_eq!(Engine::PronounceX.segment_state("ready"), SegmentReadyState::Ready);
    assert_eq!(Engine::PronounceX.segment_state("queued"), SegmentReadyState::Queued);
    assert_eq!(Engine::EdgeTts.segment_state("completed"), SegmentReadyState::Ready);
    assert_eq!(Engine::EdgeTts.segment_state("ready"), SegmentReadyState::Queued);
    assert_eq!(Engine::Bark.segment_state("failed"), SegmentReadyState::Failed);

    // Job-level "ready" only means the first segments are out
    assert_eq!(Engine::PronounceX.job_state("ready"), JobState::Processing);
    assert_eq!(Engine::PronounceX.job_state("complete"), JobState::Complete);
    assert_eq!(Engine::EdgeTts.job_state("pending"), JobState::Queued);
    assert_eq!(Engine::EdgeTts.job_state("completed"), JobState::Complete);
    assert_eq!(Engine::Espeak.job_state("failed"), JobState::Error);
    assert_eq!(Engine::Espeak.job_state("something-new"), JobState::Processing);

    assert_eq!(Engine::PronounceX.cancel_route(), CancelRoute::PostCancel);
    assert_eq!(Engine::EdgeTts.cancel_route(), CancelRoute::Delete);
    assert_eq!(Engine::EdgeTts.default_format(), AudioFormat::Mpeg);
    assert_eq!(Engine::PronounceX.chunk_limit(), None);
    assert_eq!(Engine::Bark.chunk_limit(), Some(500));
}

#[test]
fn test_engine_names_parse() {
    assert_eq!("edge-tts".parse::<Engine>(), Ok(Engine::EdgeTts));
    assert_eq!("Edge_TTS".parse::<Engine>(), Ok(Engine::EdgeTts));
    assert_eq!("pronouncex".parse::<Engine>(), Ok(Engine::PronounceX));
    assert_eq!("espeak-ng".parse::<Engine>(), Ok(Engine::Espeak));
    assert!("festival".parse::<Engine>().is_err());

    let parsed: Engine = serde_json::from_str("\"pronouncex\"").unwrap();
    assert_eq!(parsed, Engine::PronounceX);
    assert_eq!(serde_json::to_string(&Engine::EdgeTts).unwrap(), "\"edge-tts\"");
    assert_eq!(Engine::Bark.to_string(), "bark");
}

#[test]
fn test_chunker_respects_limit_and_keeps_words() {
    let text = long_text();
    let chunks = chunk_text(&text, 500);
    assert!(chunks.len() > 1);
    for chunk in &chunks {
        assert!(chunk.chars().count() <= 500, "chunk of {} chars", chunk.chars().count());
    }
    let original: Vec<&str> = text.split_whitespace().collect();
    let rejoined: Vec<&str> = chunks.iter().flat_map(|c| c.split_whitespace()).collect();
    assert_eq!(original, rejoined);
}

#[test]
fn test_chunker_edge_cases() {
    assert!(chunk_text("", 100).is_empty());
    assert!(chunk_text("  \n\n  ", 100).is_empty());
    assert_eq!(chunk_text("Short.", 100), vec!["Short.".to_string()]);

    // One word longer than the limit is hard-split
    let word = "a".repeat(25);
    let chunks = chunk_text(&word, 10);
    assert_eq!(chunks, vec!["a".repeat(10), "a".repeat(10), "a".repeat(5)]);

    // Limits count characters, not bytes
    let chunks = chunk_text("ééééé ééééé", 5);
    assert_eq!(chunks, vec!["ééééé".to_string(), "ééééé".to_string()]);
}

#[test]
fn test_indices_for_multi_segment_jobs() {
    let jobs = vec![
        job(
            "a",
            0,
            JobState::Complete,
            vec![raw("s1", 1, "ready", "http://h/a1"), raw("s0", 0, "ready", "http://h/a0")],
        ),
        job(
            "b",
            1,
            JobState::Processing,
            vec![raw("s0", 0, "ready", "http://h/b0"), raw("s1", 1, "queued", "")],
        ),
        job("c", 2, JobState::Complete, vec![raw("s0", 0, "ready", "http://h/c0")]),
    ];
    let out = assign_indices(Engine::PronounceX, &jobs);

    // Job c is held back: job b's count is not final yet
    let summary: Vec<(usize, &str, &str, SegmentReadyState)> = out
        .iter()
        .map(|d| (d.index, d.job_id.as_str(), d.segment_id.as_str(), d.state))
        .collect();
    assert_eq!(
        summary,
        vec![
            (0, "a", "s0", SegmentReadyState::Ready),
            (1, "a", "s1", SegmentReadyState::Ready),
            (2, "b", "s0", SegmentReadyState::Ready),
            (3, "b", "s1", SegmentReadyState::Queued),
        ]
    );
    assert_eq!(out[2].fetch_url, "http://h/b0");
}

#[test]
fn test_indices_are_stable_once_earlier_jobs_settle() {
    let mut jobs = vec![
        job("a", 0, JobState::Processing, vec![raw("s0", 0, "ready", "http://h/a0")]),
        job("b", 1, JobState::Complete, vec![raw("s0", 0, "ready", "http://h/b0")]),
    ];
    let before = assign_indices(Engine::PronounceX, &jobs);
    assert_eq!(before.len(), 1);

    jobs[0].state = JobState::Complete;
    jobs[0].segments.push(raw("s1", 1, "ready", "http://h/a1"));
    let after = assign_indices(Engine::PronounceX, &jobs);
    assert_eq!(after[0], before[0]);
    assert_eq!(after.len(), 3);
    assert_eq!(after[2].job_id.as_str(), "b");
    assert_eq!(after[2].index, 2);
}

#[test]
fn test_indices_for_fixed_count_jobs() {
    let jobs = vec![
        job("a", 0, JobState::Processing, vec![]),
        job("b", 1, JobState::Complete, vec![raw("0", 0, "completed", "http://h/b.mp3")]),
        job("c", 2, JobState::Error, vec![]),
        job("d", 3, JobState::Complete, vec![raw("0", 0, "completed", "")]),
    ];
    let out = assign_indices(Engine::EdgeTts, &jobs);

    let summary: Vec<(usize, &str, SegmentReadyState)> =
        out.iter().map(|d| (d.index, d.job_id.as_str(), d.state)).collect();
    assert_eq!(
        summary,
        vec![
            // Nothing yet for a, but b already knows it is index 1
            (1, "b", SegmentReadyState::Ready),
            // c failed without output: its slot is filled with a failure
            (2, "c", SegmentReadyState::Failed),
            // d finished with a segment but no URL: it can never be fetched
            (3, "d", SegmentReadyState::Failed),
        ]
    );
    assert_eq!(out[0].format, Some(AudioFormat::Mpeg));
}

#[test]
fn test_completed_job_without_segments_leaves_no_hole() {
    let jobs = vec![
        job("a", 0, JobState::Complete, vec![]),
        job("b", 1, JobState::Complete, vec![raw("0", 0, "completed", "http://h/b.mp3")]),
        job("c", 2, JobState::Processing, vec![raw("0", 0, "processing", "")]),
    ];
    let out = assign_indices(Engine::EdgeTts, &jobs);

    let summary: Vec<(usize, &str, SegmentReadyState)> =
        out.iter().map(|d| (d.index, d.job_id.as_str(), d.state)).collect();
    assert_eq!(
        summary,
        vec![
            (0, "a", SegmentReadyState::Failed),
            (1, "b", SegmentReadyState::Ready),
            // Still running, so still waiting
            (2, "c", SegmentReadyState::Queued),
        ]
    );
    assert!(out[0].fetch_url.is_empty());
}

#[test]
fn test_queued_segments_of_failed_job_become_failed() {
    let jobs = vec![job(
        "a",
        0,
        JobState::Canceled,
        vec![raw("s0", 0, "ready", "http://h/a0"), raw("s1", 1, "queued", "")],
    )];
    let out = assign_indices(Engine::PronounceX, &jobs);
    assert_eq!(out[0].state, SegmentReadyState::Ready);
    assert_eq!(out[1].state, SegmentReadyState::Failed);
}

#[tokio::test]
async fn test_submit_chunks_per_engine() {
    let text = long_text();

    // 1. Bounded engine: one job per chunk, in text order
    let backend = Arc::new(FakeBackend::new(Engine::Bark, 1));
    let client = SynthesisClient::new(backend.clone(), Engine::Bark);
    let options = SynthesisOptions {
        voice: Some("v2/en_speaker_6".to_string()),
        ..SynthesisOptions::default()
    };
    let jobs = client.submit(&text, &options).await.unwrap();
    assert!(jobs.len() > 1);
    assert_eq!(jobs.len(), backend.created_count());
    let created = backend.created.lock().unwrap().clone();
    assert!(created.iter().all(|r| r.text.chars().count() <= 500));
    assert!(created.iter().all(|r| r.voice.as_deref() == Some("v2/en_speaker_6")));
    assert!(created[0].text.starts_with("Paragraph 0"));
    let ordinals: Vec<usize> = jobs.jobs().iter().map(|j| j.ordinal).collect();
    assert_eq!(ordinals, (0..jobs.len()).collect::<Vec<_>>());

    // 2. Unbounded engine: one job for the whole text
    let backend = Arc::new(FakeBackend::new(Engine::PronounceX, 4));
    let client = SynthesisClient::new(backend.clone(), Engine::PronounceX);
    let jobs = client.submit(&text, &SynthesisOptions::default()).await.unwrap();
    assert_eq!(jobs.len(), 1);
}

#[tokio::test]
async fn test_submit_is_all_or_nothing() {
    let backend = Arc::new(FakeBackend::new(Engine::Bark, 1));
    *backend.fail_create_at.lock().unwrap() = Some(2);
    let client = SynthesisClient::new(backend.clone(), Engine::Bark);

    let err = client
        .submit(&long_text(), &SynthesisOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, SynthesisError::Status { code: 500, .. }));

    // The two jobs that did get created were cancelled with DELETE
    let cancelled = backend.cancelled.lock().unwrap().clone();
    assert_eq!(cancelled.len(), 2);
    assert!(cancelled.iter().all(|(_, route)| *route == CancelRoute::Delete));
    let ids: Vec<&str> = cancelled.iter().map(|(id, _)| id.as_str()).collect();
    assert!(ids.contains(&"job-0"));
    assert!(ids.contains(&"job-1"));
}

#[tokio::test]
async fn test_submit_rejects_blank_text() {
    let backend = Arc::new(FakeBackend::new(Engine::EdgeTts, 1));
    let client = SynthesisClient::new(backend.clone(), Engine::EdgeTts);
    let err = client.submit("   \n ", &SynthesisOptions::default()).await.unwrap_err();
    assert!(matches!(err, SynthesisError::EmptyText));
    assert_eq!(backend.created_count(), 0);
}

#[tokio::test]
async fn test_cancel_of_unknown_job_succeeds() {
    let backend = Arc::new(FakeBackend::new(Engine::PronounceX, 1));
    let client = SynthesisClient::new(backend.clone(), Engine::PronounceX);

    client.cancel(&JobId::new("ghost")).await.unwrap();
    assert_eq!(
        backend.cancelled.lock().unwrap().clone(),
        vec![(JobId::new("ghost"), CancelRoute::PostCancel)]
    );
}

#[tokio::test]
async fn test_poll_combined_merges_jobs() {
    let backend = Arc::new(FakeBackend::manual(Engine::EdgeTts));
    let client = SynthesisClient::new(backend.clone(), Engine::EdgeTts);
    let mut jobs = client
        .submit("First part.\n\nSecond part.", &SynthesisOptions::default())
        .await
        .unwrap();
    // Short text: a single chunk
    assert_eq!(jobs.len(), 1);

    let second = Arc::new(FakeBackend::manual(Engine::Bark));
    let bark = SynthesisClient::new(second.clone(), Engine::Bark);
    let text = long_text();
    let mut bark_jobs = bark.submit(&text, &SynthesisOptions::default()).await.unwrap();
    let ids = bark_jobs.job_ids();

    // 1. Second job done first
    second.set_status(
        &ids[1],
        RawJobStatus {
            status: "completed".to_string(),
            segments: vec![raw("0", 0, "completed", "http://h/1.wav")],
            error: None,
        },
    );
    let status = bark.poll_combined(&mut bark_jobs).await.unwrap();
    assert_eq!(status.overall, JobState::Processing);
    assert_eq!(status.segments.len(), 1);
    assert_eq!(status.segments[0].index, 1);

    // 2. First job fails: overall error, placeholder at index 0
    second.set_status(
        &ids[0],
        RawJobStatus {
            status: "failed".to_string(),
            segments: vec![],
            error: Some("voice not found".to_string()),
        },
    );
    let status = bark.poll_combined(&mut bark_jobs).await.unwrap();
    assert_eq!(status.overall, JobState::Error);
    assert_eq!(status.error.as_deref(), Some("voice not found"));
    assert_eq!(status.segments[0].index, 0);
    assert_eq!(status.segments[0].state, SegmentReadyState::Failed);
    assert_eq!(status.jobs[0], (ids[0].clone(), JobState::Error));
    assert_eq!(status.jobs[1], (ids[1].clone(), JobState::Complete));

    // Only jobs still running are left to cancel
    assert_eq!(bark_jobs.running().job_ids(), ids[2..].to_vec());
    let withdrawn = bark_jobs.withdraw_running();
    assert_eq!(withdrawn.job_ids(), ids[2..].to_vec());
    assert!(bark_jobs.running().is_empty());

    // 3. A job that disappears counts as canceled
    let only = jobs.job_ids()[0].clone();
    backend.forget(&only);
    let status = client.poll_combined(&mut jobs).await.unwrap();
    assert_eq!(status.overall, JobState::Canceled);
}

#[tokio::test]
async fn test_poll_combined_skips_terminal_jobs_and_reports_errors() {
    let backend = Arc::new(FakeBackend::new(Engine::EdgeTts, 1));
    let client = SynthesisClient::new(backend.clone(), Engine::EdgeTts);
    let mut jobs = client.submit("Hello there.", &SynthesisOptions::default()).await.unwrap();

    // 1. Transport trouble is surfaced
    backend.poll_errors.store(1, Ordering::SeqCst);
    assert!(client.poll_combined(&mut jobs).await.is_err());

    // 2. Then the job completes
    let status = client.poll_combined(&mut jobs).await.unwrap();
    assert_eq!(status.overall, JobState::Complete);
    assert_eq!(status.segments.len(), 1);
    let polls = backend.polls.load(Ordering::SeqCst);

    // 3. Terminal jobs are not polled again
    client.poll_combined(&mut jobs).await.unwrap();
    assert_eq!(backend.polls.load(Ordering::SeqCst), polls);
}

#[test]
fn test_poll_backoff_is_capped() {
    let settings = PollSettings {
        interval: Duration::from_millis(500),
        max_backoff: Duration::from_secs(8),
        notice_after: 5,
    };
    assert_eq!(settings.delay_after(0), Duration::from_millis(500));
    assert_eq!(settings.delay_after(1), Duration::from_secs(1));
    assert_eq!(settings.delay_after(3), Duration::from_secs(4));
    assert_eq!(settings.delay_after(10), Duration::from_secs(8));
    assert_eq!(settings.delay_after(u32::MAX), Duration::from_secs(8));
}

#[tokio::test]
async fn test_poll_loop_reports_outage_then_finishes() {
    let backend = Arc::new(FakeBackend::new(Engine::EdgeTts, 1));
    backend.poll_errors.store(3, Ordering::SeqCst);
    let client = SynthesisClient::new(backend.clone(), Engine::EdgeTts);
    let jobs = client.submit("Hello there.", &SynthesisOptions::default()).await.unwrap();

    let session = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel(16);
    let settings = PollSettings {
        interval: Duration::from_millis(2),
        max_backoff: Duration::from_millis(10),
        notice_after: 2,
    };
    let task = tokio::spawn(run_poll_loop(
        client,
        jobs,
        session,
        tx,
        CancellationToken::new(),
        settings,
    ));

    let mut unreachable = Vec::new();
    let mut reports = 0;
    while let Some(event) = rx.recv().await {
        match event {
            Event::SynthesisUnreachable {
                session: s,
                consecutive_failures,
            } => {
                assert_eq!(s, session);
                unreachable.push(consecutive_failures);
            }
            Event::SynthesisReport { overall, segments, .. } => {
                assert_eq!(overall, JobState::Complete);
                assert_eq!(segments.len(), 1);
                reports += 1;
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    // The loop ends on its own after the terminal report
    task.await.unwrap();
    assert_eq!(unreachable, vec![2, 3]);
    assert_eq!(reports, 1);
}

#[tokio::test]
async fn test_poll_loop_stops_on_cancel() {
    let backend = Arc::new(FakeBackend::manual(Engine::EdgeTts));
    let client = SynthesisClient::new(backend.clone(), Engine::EdgeTts);
    let jobs = client.submit("Hello there.", &SynthesisOptions::default()).await.unwrap();

    let token = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(64);
    let settings = PollSettings {
        interval: Duration::from_millis(2),
        max_backoff: Duration::from_millis(10),
        notice_after: 5,
    };
    let task = tokio::spawn(run_poll_loop(client, jobs, Uuid::new_v4(), tx, token.clone(), settings));

    // At least one processing report, then cancel
    assert!(matches!(rx.recv().await, Some(Event::SynthesisReport { .. })));
    token.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("poll loop did not stop")
        .unwrap();
}

#[test]
fn test_relative_urls_join_base() {
    let base = Url::parse("http://localhost:8001").unwrap();
    assert_eq!(
        resolve_url(&base, "/v1/tts/jobs/7/segments/0").unwrap().as_str(),
        "http://localhost:8001/v1/tts/jobs/7/segments/0"
    );
    assert_eq!(
        resolve_url(&base, "https://cdn.example.org/a.mp3").unwrap().as_str(),
        "https://cdn.example.org/a.mp3"
    );
}
