//! Black-box scenarios S1-S6: end-to-end behavior of a fully wired
//! [`memex_core::manager::EpisodicMemoryManager`] against an in-memory
//! store, exercised only through its public surface.

use std::collections::HashMap;
use std::time::Duration;

use memex_core::error::MemoryError;
use memex_core::types::{ContentType, FilterablePropertyValue, EPISODE_LABEL};
use memex_e2e_tests::{make_harness, make_harness_with_session_capacity};

async fn tick() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

/// S1: ingest one episode, then query long-term memory for it from a fresh
/// instance of the same session (so the hit comes from declarative memory,
/// not the still-open session window).
#[tokio::test]
async fn s1_basic_round_trip_through_declarative_memory() {
    let harness = make_harness().await;

    let guard = harness
        .manager
        .open_episodic_memory_instance("g1", "s1", vec!["user-1".to_string()], vec!["agent-1".to_string()])
        .await
        .unwrap();
    guard
        .add_memory_episode(
            "user-1",
            "agent-1",
            "The vault combination is 42-17-3.",
            "default",
            ContentType::String,
            HashMap::new(),
            HashMap::new(),
        )
        .await
        .unwrap();
    guard.close().await;

    let guard = harness
        .manager
        .open_episodic_memory_instance("g1", "s1", Vec::new(), Vec::new())
        .await
        .unwrap();
    let result = guard.query_memory("vault combination", 10, HashMap::new()).await.unwrap();

    assert_eq!(result.declarative_episodes.len(), 1);
    assert_eq!(result.declarative_episodes[0].content, "The vault combination is 42-17-3.");
    assert!(result.session_episodes.is_empty());
}

/// S2: an episode produced by a participant not on the session roster is
/// rejected, and no Episode node is ever persisted for it.
#[tokio::test]
async fn s2_unrecognized_producer_is_rejected_and_not_persisted() {
    let harness = make_harness().await;

    let guard = harness
        .manager
        .open_episodic_memory_instance("g2", "s1", vec!["user-1".to_string()], vec!["agent-1".to_string()])
        .await
        .unwrap();
    let result = guard
        .add_memory_episode(
            "stranger",
            "agent-1",
            "hi",
            "default",
            ContentType::String,
            HashMap::new(),
            HashMap::new(),
        )
        .await;
    assert!(matches!(result, Err(MemoryError::Validation(_))));

    let episode_label = [EPISODE_LABEL.to_string()].into_iter().collect();
    let nodes = harness.store.search_matching_nodes(None, Some(episode_label), HashMap::new(), false).await.unwrap();
    assert!(nodes.is_empty());
}

/// S3: session memory evicts once its capacity cap is hit and produces a
/// non-empty running summary, while the rolling window never exceeds
/// capacity.
#[tokio::test]
async fn s3_session_memory_evicts_and_summarizes() {
    let harness = make_harness_with_session_capacity(3).await;

    let guard = harness
        .manager
        .open_episodic_memory_instance("g3", "s1", vec!["user-1".to_string()], vec!["agent-1".to_string()])
        .await
        .unwrap();

    for i in 0..4 {
        guard
            .add_memory_episode(
                "user-1",
                "agent-1",
                &format!("message number {i}"),
                "default",
                ContentType::String,
                HashMap::new(),
                HashMap::new(),
            )
            .await
            .unwrap();
        tick().await;
    }

    let result = guard.query_memory("message", 10, HashMap::new()).await.unwrap();
    assert!(result.session_episodes.len() <= 3);
    assert!(!result.session_summary.is_empty());
}

/// S4: two sessions under one group stay isolated from each other when
/// queried by `session_id`.
#[tokio::test]
async fn s4_sessions_under_one_group_are_isolated() {
    let harness = make_harness().await;

    let guard1 = harness
        .manager
        .open_episodic_memory_instance("g4", "s1", vec!["user-1".to_string()], vec!["agent-1".to_string()])
        .await
        .unwrap();
    guard1
        .add_memory_episode(
            "user-1",
            "agent-1",
            "Session one secret: alpha.",
            "default",
            ContentType::String,
            HashMap::new(),
            HashMap::new(),
        )
        .await
        .unwrap();
    guard1.close().await;

    let guard2 = harness
        .manager
        .open_episodic_memory_instance("g4", "s2", vec!["user-1".to_string()], vec!["agent-1".to_string()])
        .await
        .unwrap();
    guard2
        .add_memory_episode(
            "user-1",
            "agent-1",
            "Session two secret: bravo.",
            "default",
            ContentType::String,
            HashMap::new(),
            HashMap::new(),
        )
        .await
        .unwrap();
    guard2.close().await;

    let guard1 = harness
        .manager
        .open_episodic_memory_instance("g4", "s1", Vec::new(), Vec::new())
        .await
        .unwrap();
    let mut filter = HashMap::new();
    filter.insert("session_id".to_string(), FilterablePropertyValue::Str("s1".to_string()));
    let result = guard1.query_memory("secret", 10, filter).await.unwrap();
    assert_eq!(result.declarative_episodes.len(), 1);
    assert_eq!(result.declarative_episodes[0].content, "Session one secret: alpha.");

    let guard2 = harness
        .manager
        .open_episodic_memory_instance("g4", "s2", Vec::new(), Vec::new())
        .await
        .unwrap();
    let mut filter = HashMap::new();
    filter.insert("session_id".to_string(), FilterablePropertyValue::Str("s2".to_string()));
    let result = guard2.query_memory("secret", 10, filter).await.unwrap();
    assert_eq!(result.declarative_episodes.len(), 1);
    assert_eq!(result.declarative_episodes[0].content, "Session two secret: bravo.");
}

/// S5: retrieval always returns episodes ordered ascending by timestamp,
/// regardless of insertion order of candidate scoring, with a passthrough
/// reranker in play.
#[tokio::test]
async fn s5_results_are_ordered_ascending_by_timestamp() {
    let harness = make_harness().await;

    let guard = harness
        .manager
        .open_episodic_memory_instance("g5", "s1", vec!["user-1".to_string()], vec!["agent-1".to_string()])
        .await
        .unwrap();

    let contents = ["Episode Alpha content", "Episode Beta content", "Episode Gamma content"];
    for content in contents {
        guard
            .add_memory_episode(
                "user-1",
                "agent-1",
                content,
                "default",
                ContentType::String,
                HashMap::new(),
                HashMap::new(),
            )
            .await
            .unwrap();
        tick().await;
    }
    guard.close().await;

    let guard = harness
        .manager
        .open_episodic_memory_instance("g5", "s1", Vec::new(), Vec::new())
        .await
        .unwrap();
    let result = guard.query_memory("Episode content", 10, HashMap::new()).await.unwrap();

    assert_eq!(result.declarative_episodes.len(), 3);
    let timestamps: Vec<_> = result.declarative_episodes.iter().map(|e| e.timestamp).collect();
    let mut sorted = timestamps.clone();
    sorted.sort();
    assert_eq!(timestamps, sorted);
    let returned_contents: Vec<&str> = result.declarative_episodes.iter().map(|e| e.content.as_str()).collect();
    assert_eq!(returned_contents, contents.to_vec());
}

/// S6: forgetting a session clears both its declarative episodes and its
/// session-memory window.
#[tokio::test]
async fn s6_forget_session_clears_both_memory_layers() {
    let harness = make_harness().await;

    let guard = harness
        .manager
        .open_episodic_memory_instance("g6", "s1", vec!["user-1".to_string()], vec!["agent-1".to_string()])
        .await
        .unwrap();
    for i in 0..5 {
        guard
            .add_memory_episode(
                "user-1",
                "agent-1",
                &format!("forgettable episode {i}"),
                "default",
                ContentType::String,
                HashMap::new(),
                HashMap::new(),
            )
            .await
            .unwrap();
    }

    guard.forget_session().await.unwrap();

    let result = guard.query_memory("forgettable episode", 10, HashMap::new()).await.unwrap();
    assert!(result.declarative_episodes.is_empty());
    assert!(result.session_episodes.is_empty());
    assert!(result.session_summary.is_empty());
}
