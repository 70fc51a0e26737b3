pub mod auth;
pub mod config;
pub mod error;
pub mod executor;
pub mod git;
pub mod mcp;
pub mod notify;
pub mod project;
pub mod security;
pub mod storage;
pub mod tasks;

use std::sync::Arc;

use anyhow::Result;

use auth::{MemoryAuthStore, OAuthServer, SqliteAuthStore};
use config::Config;
use mcp::ratelimit::RateLimiter;
use mcp::SessionRegistry;
use notify::mcp::McpNotifier;
use notify::Hub;
use project::ProjectManager;
use storage::Store;
use tasks::manager::TaskManager;

/// Shared application state handed to every HTTP handler and background
/// job.
pub struct AppContext {
    pub config: Config,
    pub projects: Arc<ProjectManager>,
    pub tasks: Arc<TaskManager>,
    pub oauth: Arc<OAuthServer>,
    pub store: Option<Arc<Store>>,
    pub sessions: Arc<SessionRegistry>,
    /// Per-client-IP limiter for unauthenticated endpoints. `None` when
    /// rate limiting is disabled.
    pub ip_limiter: Option<Arc<RateLimiter>>,
    /// Per-bearer-token limiter for the MCP endpoint.
    pub token_limiter: Option<Arc<RateLimiter>>,
}

impl AppContext {
    /// Wire up the full application: executors, projects, task manager,
    /// notifier hub, OAuth server, limiters, and the startup task replay.
    pub async fn build(config: Config, store: Option<Arc<Store>>) -> Result<Arc<Self>> {
        executor::register_builtins();

        let projects = Arc::new(ProjectManager::new(&config.projects));

        let settings = executor::Settings {
            claude_path: config.execution.claude_path.clone(),
            work_dir: config.work_dir(),
            env: config.execution.env.clone(),
        };
        let agent = executor::create("claude-code", &settings)?;

        let sessions = Arc::new(SessionRegistry::new());
        let mcp_sink: Arc<dyn notify::Notifier> = Arc::new(McpNotifier::new(
            sessions.clone(),
            config.notify.debounce_window,
        ));
        let hub = Hub::new(vec![mcp_sink]);

        let persist = storage::spawn_task_writer(store.clone());
        let tasks = TaskManager::new(
            agent,
            projects.clone(),
            config.execution.max_concurrent,
            persist,
            hub,
        );

        if let Some(store) = &store {
            let rows = store.load_tasks().await?;
            if !rows.is_empty() {
                let (restored, failed) = tasks.restore(&rows);
                tracing::info!(restored, failed, "replayed persisted tasks");
            }
        }

        let issuer = if config.server.public_url.is_empty() {
            format!("http://{}:{}", config.server.host, config.server.port)
        } else {
            config.server.public_url.clone()
        };
        let auth_store: Arc<dyn auth::AuthStore> = match &store {
            Some(store) => Arc::new(SqliteAuthStore::new(store.clone())),
            None => Arc::new(MemoryAuthStore::new()),
        };
        let oauth = Arc::new(OAuthServer::new(config.auth.clone(), issuer, auth_store));

        let ip_limiter = RateLimiter::from_config(config.rate_limit);
        let token_limiter = RateLimiter::from_config(config.rate_limit);

        Ok(Arc::new(Self {
            config,
            projects,
            tasks,
            oauth,
            store,
            sessions,
            ip_limiter,
            token_limiter,
        }))
    }
}
