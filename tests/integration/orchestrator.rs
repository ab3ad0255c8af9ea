//! End-to-end behaviour of the generation pipeline with fake engines.

use crate::helpers::{FakeLlm, FakeTts, Reply, WAIT, start_pipeline, wait_for_event};
use cadence::PipelineEvent;
use cadence::pipeline::abort::AbortOutcome;
use cadence::pipeline::generation::ReplyOutcome;
use std::time::Duration;

#[tokio::test]
async fn at_most_one_generation_is_ever_current() {
    let mut h = start_pipeline(
        FakeLlm::always(Reply::Hang(vec!["Thinking about it"])),
        FakeTts::new(1),
    );
    let utterances = [
        "what is the capital of France",
        "play some relaxing jazz music",
        "set a timer for ten minutes",
        "how tall is mount everest",
        "remind me to call my sister",
    ];
    for text in utterances {
        h.pipeline.prepare(text);
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    let last = h.pipeline.current_generation_id().unwrap();
    h.pipeline.shutdown().await;

    let mut current: Option<u64> = None;
    let mut started = 0;
    while let Ok(event) = h.events.try_recv() {
        match event {
            PipelineEvent::GenerationStarted { id, .. } => {
                assert_eq!(current, None, "generation {id} started over a live one");
                current = Some(id);
                started += 1;
            }
            PipelineEvent::GenerationAborted { id, .. }
            | PipelineEvent::GenerationCompleted { id, .. }
            | PipelineEvent::GenerationFailed { id, .. } => {
                if current == Some(id) {
                    current = None;
                }
            }
            _ => {}
        }
    }
    assert!(started >= 2);
    assert!(last >= 2);
}

#[tokio::test]
async fn nothing_is_played_after_an_interrupt() {
    let mut h = start_pipeline(
        FakeLlm::always(Reply::Hang(vec![
            "Well, that is a long story. ",
            "It began many years ago",
        ])),
        FakeTts::new(50).paced(Duration::from_millis(5)),
    );
    h.pipeline.prepare("tell me the story");
    let mut reply = tokio::time::timeout(WAIT, h.replies.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(reply.next_audio().await.is_some());

    let outcome = h.pipeline.interrupt("user started speaking").await;
    assert_eq!(outcome, AbortOutcome::Aborted(reply.id()));
    assert!(reply.next_audio().await.is_none());
    assert_eq!(
        reply.outcome().await,
        ReplyOutcome::Aborted {
            reason: "user started speaking".into()
        }
    );
    assert_eq!(h.pipeline.current_generation_id(), None);
    assert_eq!(h.llm.cancels(), 1);
    assert_eq!(h.tts.stops(), 1);

    let status = h.pipeline.status();
    assert!(status.current.is_none());
    assert_eq!(status.history_messages, 0);
    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn reply_text_is_exactly_the_streamed_text() {
    let tokens = vec![
        "Sure",
        "! The weather ",
        "today is sunny, ",
        "with a high ",
        "of twenty degrees. ",
        "Enjoy",
        " it.",
    ];
    let expected: String = tokens.concat();
    let mut h = start_pipeline(FakeLlm::always(Reply::Tokens(tokens)), FakeTts::new(1));
    h.pipeline.prepare("what's the weather");

    let mut reply = tokio::time::timeout(WAIT, h.replies.recv())
        .await
        .unwrap()
        .unwrap();
    let mut chunks = 0;
    while tokio::time::timeout(WAIT, reply.next_audio())
        .await
        .unwrap()
        .is_some()
    {
        chunks += 1;
    }
    assert!(chunks >= 2);
    assert_eq!(
        reply.outcome().await,
        ReplyOutcome::Completed {
            text: expected.clone()
        }
    );
    let quick = reply.quick_answer().unwrap();
    assert!(expected.starts_with(quick));

    let PipelineEvent::GenerationCompleted { text, .. } = wait_for_event(&mut h.events, |e| {
        matches!(e, PipelineEvent::GenerationCompleted { .. })
    })
    .await
    else {
        unreachable!()
    };
    assert_eq!(text, expected);

    // Every spoken span is a piece of the reply.
    let spoken = h.tts.texts();
    assert!(spoken.iter().any(|span| span == quick.trim()));
    for span in &spoken {
        assert!(expected.contains(span.as_str()), "{span:?} not in reply");
    }
    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn quick_answer_audio_precedes_final_answer_audio() {
    // Quick answer "Of course, I can help with that." is 32 bytes; the
    // overhang "Just tell me more." is 18.
    let mut h = start_pipeline(
        FakeLlm::always(Reply::Tokens(vec![
            "Of course, I can help with that.",
            " Just tell me more.",
        ])),
        FakeTts::new(3).paced(Duration::from_millis(2)),
    );
    h.pipeline.prepare("can you help me");
    let mut reply = tokio::time::timeout(WAIT, h.replies.recv())
        .await
        .unwrap()
        .unwrap();
    let mut values = Vec::new();
    while let Some(chunk) = tokio::time::timeout(WAIT, reply.next_audio()).await.unwrap() {
        values.push(chunk.samples[0]);
    }
    assert_eq!(values, vec![32, 32, 32, 18, 18, 18]);
    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn queued_abort_stops_the_running_reply() {
    let mut h = start_pipeline(
        FakeLlm::always(Reply::Hang(vec!["Let me think"])),
        FakeTts::new(1),
    );
    h.pipeline.prepare("solve this riddle");
    wait_for_event(&mut h.events, |e| {
        matches!(e, PipelineEvent::GenerationStarted { .. })
    })
    .await;

    h.pipeline.abort("client abort");
    let event = wait_for_event(&mut h.events, |e| {
        matches!(e, PipelineEvent::GenerationAborted { .. })
    })
    .await;
    assert!(matches!(
        event,
        PipelineEvent::GenerationAborted { id: 1, ref reason } if reason == "client abort"
    ));
    assert_eq!(h.pipeline.current_generation_id(), None);
    h.pipeline.shutdown().await;
}

#[tokio::test]
async fn conversation_history_follows_completed_replies_only() {
    let mut h = start_pipeline(
        FakeLlm::new(
            vec![
                Reply::Tokens(vec!["Paris is the capital of France."]),
                Reply::Hang(vec!["Hmm"]),
            ],
            Reply::Tokens(vec!["It is about 2.1 million."]),
        ),
        FakeTts::new(1),
    );
    h.pipeline.prepare("what is the capital of France");
    wait_for_event(&mut h.events, |e| {
        matches!(e, PipelineEvent::GenerationCompleted { .. })
    })
    .await;

    h.pipeline.prepare("tell me a joke about cats");
    wait_for_event(&mut h.events, |e| {
        matches!(e, PipelineEvent::GenerationStarted { id: 2, .. })
    })
    .await;
    h.pipeline.interrupt("changed my mind").await;

    h.pipeline.prepare("how many people live there");
    wait_for_event(&mut h.events, |e| {
        matches!(e, PipelineEvent::GenerationCompleted { id: 3, .. })
    })
    .await;

    let prompts = h.llm.prompts();
    let last: Vec<&str> = prompts[2]
        .messages
        .iter()
        .map(|m| m.content.as_str())
        .collect();
    assert!(last.ends_with(&[
        "what is the capital of France",
        "Paris is the capital of France.",
        "how many people live there",
    ]));
    assert!(!last.contains(&"tell me a joke about cats"));
    h.pipeline.shutdown().await;
}
