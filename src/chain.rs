use crate::error::ChainError;
use crate::llm::{ChatMessage, LanguageModel};
use crate::memory::ConversationMemory;
use crate::models::SearchResult;
use crate::search::VectorIndex;
use std::sync::Arc;
use tokio::sync::Mutex;

const ANSWER_PROMPT: &str = "Use the following pieces of context to answer the user's question. \
If you don't know the answer, just say that you don't know, don't try to make up an answer. \
If the answer is a link, reply with the bare URL and nothing else.";

const CONDENSE_PROMPT: &str = "Given the following conversation and a follow up question, \
rephrase the follow up question to be a standalone question, in its original language.";

/// Result of one chain invocation
#[derive(Debug, Clone)]
pub struct ChainOutput {
    pub answer: String,
    /// The question actually used for retrieval
    pub standalone_question: String,
    pub sources: Vec<SearchResult>,
}

/// Conversational retrieval QA over one index generation.
///
/// A chain is immutable apart from its memory; reloading the document builds a
/// new chain (and thus starts a new conversation).
pub struct QaChain {
    index: Arc<VectorIndex>,
    llm: Arc<dyn LanguageModel>,
    memory: Mutex<ConversationMemory>,
    top_k: usize,
}

impl QaChain {
    pub fn new(
        index: VectorIndex,
        llm: Arc<dyn LanguageModel>,
        memory_turns: usize,
        top_k: usize,
    ) -> Self {
        Self {
            index: Arc::new(index),
            llm,
            memory: Mutex::new(ConversationMemory::new(memory_turns)),
            top_k,
        }
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn generation(&self) -> u64 {
        self.index.meta().generation
    }

    pub async fn memory(&self) -> ConversationMemory {
        self.memory.lock().await.clone()
    }

    /// Answer `question`, using and then extending the conversation history
    pub async fn invoke(&self, question: &str) -> Result<ChainOutput, ChainError> {
        // Snapshot so concurrent questions don't wait on each other's LLM calls
        let history = self.memory.lock().await.clone();

        let standalone_question = if history.is_empty() {
            question.to_string()
        } else {
            let condensed = self
                .llm
                .chat(&condense_messages(&history, question))
                .await?;
            let condensed = condensed.trim();
            if condensed.is_empty() {
                question.to_string()
            } else {
                condensed.to_string()
            }
        };

        let sources = self.retrieve(&standalone_question).await?;

        let answer = self
            .llm
            .chat(&answer_messages(&sources, &history, question))
            .await?
            .trim()
            .to_string();

        let mut memory = self.memory.lock().await;
        memory.push(question, answer.clone());
        log::debug!("🧠 Conversation summary:\n{}", memory.buffer());

        Ok(ChainOutput {
            answer,
            standalone_question,
            sources,
        })
    }

    /// SQLite lookups and query inference run on the blocking pool
    async fn retrieve(&self, query: &str) -> Result<Vec<SearchResult>, ChainError> {
        let index = Arc::clone(&self.index);
        let query = query.to_string();
        let top_k = self.top_k;

        tokio::task::spawn_blocking(move || index.search(&query, top_k))
            .await
            .map_err(|e| ChainError::Retrieval(e.into()))?
            .map_err(ChainError::Retrieval)
    }
}

fn condense_messages(history: &ConversationMemory, question: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(CONDENSE_PROMPT),
        ChatMessage::user(format!(
            "Chat History:\n{}\nFollow Up Input: {}\nStandalone question:",
            history.buffer(),
            question
        )),
    ]
}

fn answer_messages(
    sources: &[SearchResult],
    history: &ConversationMemory,
    question: &str,
) -> Vec<ChatMessage> {
    let context = sources
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut messages = vec![ChatMessage::system(format!(
        "{}\n----------------\n{}",
        ANSWER_PROMPT, context
    ))];
    messages.extend(history.as_messages());
    messages.push(ChatMessage::user(question));
    messages
}
