pub mod agent;
pub mod models;
pub mod server;
pub mod config;
pub mod llm;
pub mod cli;
pub mod history;

use agent::ChatAgent;
use cli::Args;
use config::models::load_models_file;
use history::initialize_conversation_store;
use llm::LlmConfig;
use llm::chat::new_client as new_chat_client;
use llm::directory::ModelDirectory;
use llm::resolver::{ ModelResolver, ResolverSettings };
use log::{ info, warn };
use server::{ Server, ServerConfig };
use std::error::Error;
use std::sync::Arc;

pub fn load_model_directory(args: &Args) -> Result<ModelDirectory, Box<dyn Error + Send + Sync>> {
    match &args.models_path {
        Some(path) => {
            let overrides = load_models_file(path)?;
            Ok(ModelDirectory::with_overrides(&overrides)?)
        }
        None => Ok(ModelDirectory::builtin()),
    }
}

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("OpenRouter Base URL: {}", args.base_url);
    info!("Default Model: {}", args.default_model);
    info!("Default Temperature: {}", args.default_temperature);
    info!("Force Internet Search: {}", args.force_internet_search);
    info!("Max Reasoning Tokens: {}", args.max_reasoning_tokens);
    info!("Timeouts: {}s standard, {}s reasoning", args.standard_timeout_secs, args.reasoning_timeout_secs);
    info!("Rate Limit: {} requests/minute", args.rate_limit_per_minute);
    info!("History Store Type: {}", args.history_type);
    if let Some(path) = &args.models_path {
        info!("Model Overrides: {}", path);
    }
    info!("Max Message Size: {} bytes", args.max_message_size);
    info!("Max Concurrent Requests: {}", args.max_concurrent_requests);
    info!("-------------------------");

    let directory = Arc::new(load_model_directory(&args)?);
    let resolver = Arc::new(ModelResolver::new(directory, ResolverSettings::from_args(&args)));
    let store = initialize_conversation_store(&args).await?;

    if args.cleanup_days > 0 {
        match store.purge_older_than(chrono::Duration::days(args.cleanup_days)).await {
            Ok(purged) => info!("Start-up cleanup removed {} conversations", purged),
            Err(e) => warn!("Start-up cleanup failed: {}", e),
        }
    }

    let chat_client = new_chat_client(&LlmConfig::from_args(&args))?;
    let agent = Arc::new(ChatAgent::new(store, resolver, chat_client, args.default_temperature));
    let server = Arc::new(Server::new(agent, ServerConfig::from_args(&args)));
    server.run().await?;

    Ok(())
}
