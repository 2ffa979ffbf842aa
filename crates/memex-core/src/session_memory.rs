//! Short-term session memory: a bounded rolling window of recent episodes
//! plus an asynchronously maintained running summary.
//!
//! Grounded on `short_term_memory/session_memory.py`. Eviction is driven by
//! three independent caps (episode count, total message length, total
//! approximate token count); whichever is hit first triggers a summary
//! refresh. The refresh itself runs in a spawned task so `add_episode`
//! never blocks on a language-model round trip; the next eviction (or an
//! explicit [`SessionMemory::close`]) waits for the prior refresh to finish
//! before starting a new one, matching the original's `self._summary_task`
//! bookkeeping.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::config::{render_prompt_template, DEFAULT_SUMMARY_SYSTEM_PROMPT, DEFAULT_SUMMARY_USER_PROMPT};
use crate::language_model::{LanguageModel, ToolChoice};
use crate::types::{approx_token_count, Episode};

struct State {
    memory: VecDeque<Episode>,
    current_episode_count: usize,
    current_message_len: usize,
    current_token_num: usize,
    summary: String,
    summary_task: Option<JoinHandle<()>>,
}

/// Rolling short-term memory for a single session. Holds recent episodes up
/// to `capacity` and a running summary of everything evicted so far.
/// Mirrors `SessionMemory`.
pub struct SessionMemory {
    language_model: Arc<dyn LanguageModel>,
    summary_system_prompt: String,
    summary_user_prompt: String,
    capacity: usize,
    max_message_len: usize,
    max_token_num: usize,
    state: Arc<AsyncMutex<State>>,
}

impl SessionMemory {
    pub fn new(language_model: Arc<dyn LanguageModel>) -> Self {
        Self {
            language_model,
            summary_system_prompt: DEFAULT_SUMMARY_SYSTEM_PROMPT.to_string(),
            summary_user_prompt: DEFAULT_SUMMARY_USER_PROMPT.to_string(),
            capacity: 500,
            max_message_len: 8000,
            max_token_num: 4000,
            state: Arc::new(AsyncMutex::new(State {
                memory: VecDeque::new(),
                current_episode_count: 0,
                current_message_len: 0,
                current_token_num: 0,
                summary: String::new(),
                summary_task: None,
            })),
        }
    }

    pub fn with_summary_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.summary_system_prompt = prompt.into();
        self
    }

    pub fn with_summary_user_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.summary_user_prompt = prompt.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_max_message_len(mut self, max_message_len: usize) -> Self {
        self.max_message_len = max_message_len;
        self
    }

    pub fn with_max_token_num(mut self, max_token_num: usize) -> Self {
        self.max_token_num = max_token_num;
        self
    }

    /// Append an episode to the rolling window, evicting (and kicking off a
    /// background summary refresh) if any cap is now exceeded. Returns
    /// whether an eviction was triggered.
    pub async fn add_episode(&self, episode: Episode) -> bool {
        let mut state = self.state.lock().await;
        push_with_maxlen(&mut state.memory, episode.clone(), self.capacity);
        state.current_episode_count += 1;
        state.current_message_len += episode.content.chars().count();
        state.current_token_num += compute_token_num_episode(&episode);

        let full = state.current_episode_count >= self.capacity
            || state.current_message_len >= self.max_message_len
            || state.current_token_num >= self.max_token_num;
        if full {
            self.evict(&mut state).await;
        }
        full
    }

    /// Trim the rolling window down to the episodes added since the last
    /// eviction, reset the counters, and spawn a summary refresh over the
    /// retained snapshot once the previous refresh (if any) has finished.
    async fn evict(&self, state: &mut State) {
        while state.memory.len() > state.current_episode_count {
            state.memory.pop_front();
        }
        let snapshot: Vec<Episode> = state.memory.iter().cloned().collect();
        state.current_episode_count = 0;
        state.current_message_len = 0;
        state.current_token_num = 0;

        if let Some(task) = state.summary_task.take() {
            let _ = task.await;
        }

        let state_for_task = Arc::clone(&self.state);
        let language_model = Arc::clone(&self.language_model);
        let system_prompt = self.summary_system_prompt.clone();
        let user_prompt_template = self.summary_user_prompt.clone();
        state.summary_task = Some(tokio::spawn(async move {
            refresh_summary(state_for_task, language_model, system_prompt, user_prompt_template, snapshot)
                .await;
        }));
    }

    /// The running summary plus as many of the most recent episodes as fit
    /// within `limit` episodes and `max_token_num` tokens (0 means
    /// unlimited for either cap), returned oldest-first. Waits for any
    /// in-flight summary refresh to land first, matching the original's
    /// `get_session_memory_context`.
    pub async fn get_session_memory_context(
        &self,
        query: &str,
        limit: usize,
        max_token_num: usize,
    ) -> (Vec<Episode>, String) {
        let mut state = self.state.lock().await;
        if let Some(task) = state.summary_task.take() {
            let _ = task.await;
        }
        tracing::debug!(query, "get session memory context");

        let mut length = approx_token_count(&state.summary);
        let mut episodes: VecDeque<Episode> = VecDeque::new();
        for episode in state.memory.iter().rev() {
            if max_token_num > 0 && length >= max_token_num {
                break;
            }
            if limit > 0 && episodes.len() >= limit {
                break;
            }
            let token_num = compute_token_num_episode(episode);
            if max_token_num > 0 && length + token_num > max_token_num {
                break;
            }
            episodes.push_front(episode.clone());
            length += token_num;
        }
        (episodes.into_iter().collect(), state.summary.clone())
    }

    /// Drop the rolling window and running summary entirely, awaiting any
    /// in-flight refresh first.
    pub async fn clear_memory(&self) {
        let mut state = self.state.lock().await;
        if let Some(task) = state.summary_task.take() {
            let _ = task.await;
        }
        state.memory.clear();
        state.current_episode_count = 0;
        state.current_message_len = 0;
        state.current_token_num = 0;
        state.summary.clear();
    }

    /// Release resources held by this session memory. Equivalent to
    /// [`SessionMemory::clear_memory`]; kept as a distinct method to mirror
    /// the original's explicit `close` lifecycle hook.
    pub async fn close(&self) {
        self.clear_memory().await;
    }
}

fn push_with_maxlen(deque: &mut VecDeque<Episode>, episode: Episode, capacity: usize) {
    deque.push_back(episode);
    while deque.len() > capacity {
        deque.pop_front();
    }
}

fn compute_token_num_episode(episode: &Episode) -> usize {
    let mut chars = episode.content.chars().count();
    for value in episode.user_metadata.values() {
        chars += match value {
            serde_json::Value::String(s) => s.chars().count(),
            other => other.to_string().chars().count(),
        };
    }
    chars / 4
}

fn render_episode_line(episode: &Episode) -> String {
    let mut metadata_keys: Vec<&String> = episode.user_metadata.keys().collect();
    metadata_keys.sort();
    let meta = metadata_keys
        .into_iter()
        .map(|key| {
            let value = &episode.user_metadata[key];
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("[{key}: {rendered}] ")
        })
        .collect::<String>();
    format!("[{} : {}{}]", episode.uuid, meta, episode.content)
}

/// Best-effort: a failed summary refresh is logged, not propagated, since no
/// caller is awaiting this task directly.
async fn refresh_summary(
    state: Arc<AsyncMutex<State>>,
    language_model: Arc<dyn LanguageModel>,
    system_prompt: String,
    user_prompt_template: String,
    episodes: Vec<Episode>,
) {
    let previous_summary = {
        let state = state.lock().await;
        state.summary.clone()
    };
    let episode_text = episodes.iter().map(render_episode_line).collect::<Vec<_>>().join("");
    let mut values = std::collections::HashMap::new();
    values.insert("episodes", episode_text.as_str());
    values.insert("summary", previous_summary.as_str());
    let user_prompt = render_prompt_template(&user_prompt_template, &values);

    match language_model
        .generate_response(Some(&system_prompt), Some(&user_prompt), None, ToolChoice::Auto, 3)
        .await
    {
        Ok((summary, _tool_calls)) => {
            let mut state = state.lock().await;
            state.summary = summary;
        }
        Err(error) => {
            tracing::warn!(%error, "session memory summary refresh failed");
        }
    }
}
