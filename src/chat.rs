//! One question/answer turn over the document library.
//!
//! A turn retrieves context for the question, builds the prompt, asks the
//! generation backend, records the exchange as a [`Conversation`], and
//! reports which documents the context came from.

use std::io::Write;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::context::ContextBuilder;
use crate::embedding::OllamaEmbedder;
use crate::error::{deadline_token, with_cancel, Result};
use crate::generate::{GenerationClient, OllamaClient};
use crate::models::{Conversation, RetrievalResult};
use crate::retrieve::Retriever;
use crate::store::sqlite::SqliteStore;
use crate::store::DocumentStore;

#[derive(Debug, Clone, Copy, Default)]
pub struct AskOptions {
    /// Filter semantic hits by query keywords.
    pub hybrid: bool,
    /// Deliver the answer through the token callback as it is generated.
    pub stream: bool,
}

#[derive(Debug, Clone)]
pub struct ChatAnswer {
    pub answer: String,
    pub model: String,
    /// Distinct file names of the documents that supplied context.
    pub sources: Vec<String>,
    pub conversation_id: String,
}

pub struct ChatSession {
    store: Arc<dyn DocumentStore>,
    retriever: Retriever,
    context: ContextBuilder,
    generator: Arc<dyn GenerationClient>,
    model: String,
}

impl ChatSession {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        retriever: Retriever,
        context: ContextBuilder,
        generator: Arc<dyn GenerationClient>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            store,
            retriever,
            context,
            generator,
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Answer `query`. Streaming output goes to `on_token`.
    ///
    /// Generation errors propagate. Failing to save the conversation does not
    /// fail the turn.
    pub async fn ask(
        &self,
        query: &str,
        options: AskOptions,
        cancel: &CancellationToken,
        on_token: &mut (dyn for<'t> FnMut(&'t str) + Send),
    ) -> Result<ChatAnswer> {
        let result = if options.hybrid {
            self.retriever.retrieve_hybrid(query, cancel).await?
        } else {
            self.retriever.retrieve(query, cancel).await?
        };

        let context = self.context.build_context(&result);
        let prompt = self.context.build_prompt(&context, query);
        info!(
            model = %self.model,
            chunks = result.chunks.len(),
            images = result.images.len(),
            prompt_chars = prompt.len(),
            "generating"
        );

        let answer = if options.stream {
            with_cancel(
                cancel,
                self.generator.generate_stream(&self.model, &prompt, on_token),
            )
            .await?
        } else {
            with_cancel(cancel, self.generator.generate(&self.model, &prompt)).await?
        };

        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            user_message: query.to_string(),
            assistant_message: answer.clone(),
            model_name: self.model.clone(),
            context_chunk_ids: ContextBuilder::chunk_ids(&result),
            context_image_ids: ContextBuilder::image_ids(&result),
            created_at: chrono::Utc::now().timestamp(),
        };
        if let Err(e) = self.store.save_conversation(&conversation).await {
            warn!(error = %e, "could not save conversation");
        }

        let sources = self.sources(&result).await?;
        Ok(ChatAnswer {
            answer,
            model: self.model.clone(),
            sources,
            conversation_id: conversation.id,
        })
    }

    /// File names of the documents behind `result`, first appearance first.
    async fn sources(&self, result: &RetrievalResult) -> Result<Vec<String>> {
        let mut seen_ids: Vec<&str> = Vec::new();
        for id in result
            .chunks
            .iter()
            .map(|c| c.item.document_id.as_str())
            .chain(result.images.iter().map(|i| i.item.document_id.as_str()))
        {
            if !seen_ids.contains(&id) {
                seen_ids.push(id);
            }
        }

        let mut names: Vec<String> = Vec::new();
        for id in seen_ids {
            if let Some(doc) = self.store.get_document(id).await? {
                if !names.contains(&doc.file_name) {
                    names.push(doc.file_name);
                }
            }
        }
        Ok(names)
    }
}

/// `docchat ask`
pub async fn run_ask(
    config: &Config,
    query: &str,
    model: Option<&str>,
    no_stream: bool,
    hybrid: bool,
    timeout_secs: Option<u64>,
) -> anyhow::Result<()> {
    let store = Arc::new(SqliteStore::connect(config).await?);
    let embedder = Arc::new(OllamaEmbedder::new(config)?);
    let retriever = Retriever::from_store(embedder, store.clone(), config.retrieval.top_k);
    let client = OllamaClient::new(config)?;
    let model = client
        .resolve_model(model.unwrap_or(config.ollama.model.as_str()))
        .await?;

    let session = ChatSession::new(
        store.clone(),
        retriever,
        ContextBuilder::new(config.retrieval.max_context_tokens),
        Arc::new(client),
        model,
    );

    let options = AskOptions {
        hybrid: hybrid || config.retrieval.hybrid,
        stream: !no_stream,
    };
    let cancel = deadline_token(timeout_secs);
    let mut print_token = |token: &str| {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(token.as_bytes());
        let _ = stdout.flush();
    };
    let answer = session
        .ask(query, options, &cancel, &mut print_token)
        .await?;

    if options.stream {
        println!();
    } else {
        println!("{}", answer.answer);
    }

    if !answer.sources.is_empty() {
        println!();
        println!("Sources:");
        for source in &answer.sources {
            println!("  - {}", source);
        }
    }

    store.close().await;
    Ok(())
}
