//! MCP server implementation for Foreman.
//!
//! This module defines the `ForemanServer` struct that implements the MCP
//! `ServerHandler` trait, exposing Buildbot operations as tools.

use std::fmt::Write as _;

use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router, ServerHandler,
};

use crate::client::{build_page, builders_page, ApiClient};
use crate::commands::{self, ForcedBuild, StoppedBuild};
use crate::error::ForemanError;
use crate::models::{resolve_fields, Build, Builder, ForceScheduler};
use crate::session::NonInteractivePrompt;
use crate::tools::{
    ForceBuildInput, ListBuildersInput, ListForceSchedulersInput, ListRunningBuildsInput,
    StopBuildInput,
};

/// The Foreman MCP server.
///
/// This server exposes Buildbot operations as MCP tools.
#[derive(Clone)]
pub struct ForemanServer {
    /// API client for Buildbot operations.
    client: ApiClient,
    /// Tool router for MCP tool dispatch.
    tool_router: ToolRouter<Self>,
}

/// Turns a declined login into an error for the tool caller.
fn accepted<T>(outcome: Option<T>) -> Result<T, ForemanError> {
    outcome.ok_or(ForemanError::CredentialDenied)
}

#[tool_router]
impl ForemanServer {
    /// Creates a new Foreman server instance.
    pub fn new(client: ApiClient) -> Self {
        Self {
            client,
            tool_router: Self::tool_router(),
        }
    }

    /// Returns "pong" on success.
    #[tool(description = "Test connectivity to the Foreman MCP server. Returns 'pong' if the server is running correctly.")]
    fn ping(&self) -> String {
        tracing::debug!("ping tool called");
        "pong".to_string()
    }

    /// List active builders with their most recent completed build.
    #[tool(description = "List the active Buildbot builders with their IDs and, by default, the result of each builder's most recent completed build.")]
    async fn list_builders(
        &self,
        Parameters(input): Parameters<ListBuildersInput>,
    ) -> Result<String, String> {
        tracing::debug!(?input, "list_builders tool called");

        let outcome = if input.include_last_build.unwrap_or(true) {
            self.client.list_builders_with_last_build().await
        } else {
            self.client.list_builders().await
        };
        let builders = match outcome.and_then(accepted) {
            Ok(builders) => builders,
            Err(e) => return Err(self.report("Failed to list builders", e).await),
        };

        Ok(format_builder_list(&builders, &self.client.url().await))
    }

    /// List running builds, optionally of a single builder.
    #[tool(description = "List the builds currently running, optionally only those of one builder. Returns build IDs usable with stop_build.")]
    async fn list_running_builds(
        &self,
        Parameters(input): Parameters<ListRunningBuildsInput>,
    ) -> Result<String, String> {
        let input = input.sanitize();
        tracing::debug!(?input, "list_running_builds tool called");

        let result = async {
            let builders = accepted(self.client.list_builders().await?)?;
            let builderid = match &input.builder {
                Some(name) => Some(
                    builders
                        .iter()
                        .find(|b| &b.name == name)
                        .map(|b| b.builderid)
                        .ok_or_else(|| {
                            ForemanError::validation(format!("no active builder named '{}'", name))
                        })?,
                ),
                None => None,
            };
            let builds = accepted(self.client.running_builds(builderid).await?)?;
            Ok::<_, ForemanError>((builds, builders))
        }
        .await;

        match result {
            Ok((builds, builders)) => Ok(format_running_builds(
                &builds,
                &builders,
                &self.client.url().await,
            )),
            Err(e) => Err(self.report("Failed to list running builds", e).await),
        }
    }

    /// Stop a running build.
    #[tool(description = "Stop a running build by its build ID, with an optional reason.")]
    async fn stop_build(
        &self,
        Parameters(input): Parameters<StopBuildInput>,
    ) -> Result<String, String> {
        let input = input.sanitize();
        tracing::debug!(build_id = input.build_id, "stop_build tool called");

        let outcome = commands::stop_build(
            &self.client,
            &NonInteractivePrompt,
            Some(input.build_id),
            input.reason.as_deref(),
        )
        .await
        .and_then(accepted);

        match outcome {
            Ok(stopped) => Ok(format_stop_result(&stopped)),
            Err(e) => {
                let action = format!("Failed to stop build {}", input.build_id);
                Err(self.report(&action, e).await)
            }
        }
    }

    /// List force schedulers and the parameters they accept.
    #[tool(description = "List force schedulers with the builders they can build and the parameters they accept (name, default, required). Optionally filter by builder name.")]
    async fn list_force_schedulers(
        &self,
        Parameters(input): Parameters<ListForceSchedulersInput>,
    ) -> Result<String, String> {
        let input = input.sanitize();
        tracing::debug!(?input, "list_force_schedulers tool called");

        let outcome = self
            .client
            .force_schedulers(input.builder.as_deref())
            .await
            .and_then(accepted)
            .and_then(|schedulers| format_scheduler_list(&schedulers));

        match outcome {
            Ok(text) => Ok(text),
            Err(e) => Err(self.report("Failed to list force schedulers", e).await),
        }
    }

    /// Force a build of a builder.
    #[tool(description = "Force a build of a builder. Parameters not given keep their defaults; required parameters without a default must be given. The scheduler is needed only when several can build the builder.")]
    async fn force_build(
        &self,
        Parameters(input): Parameters<ForceBuildInput>,
    ) -> Result<String, String> {
        let input = input.sanitize();
        tracing::debug!(builder = %input.builder, scheduler = ?input.scheduler, "force_build tool called");

        if input.builder.is_empty() {
            return Err("Builder name cannot be empty".to_string());
        }

        let outcome = commands::force_with_values(
            &self.client,
            &input.builder,
            input.scheduler.as_deref(),
            &input.parameters,
        )
        .await
        .and_then(accepted);

        match outcome {
            Ok(forced) => Ok(format_force_result(&forced)),
            Err(e) => {
                let action = format!("Failed to force build of {}", input.builder);
                Err(self.report(&action, e).await)
            }
        }
    }

    /// Logs a failure and renders it for the caller, with the password scrubbed.
    async fn report(&self, action: &str, error: ForemanError) -> String {
        let secret = self.client.secret_for_sanitization().await;
        let sanitized = error.sanitized_display(&secret);
        tracing::error!(error = %sanitized, "{}", action);
        if error.is_auth_failure() {
            return format!("{}: {} (check BUILDBOT_USER and BUILDBOT_PASSWORD)", action, sanitized);
        }
        format!("{}: {}", action, sanitized)
    }
}

#[tool_handler]
impl ServerHandler for ForemanServer {
    /// Returns server information for the MCP initialize handshake.
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Foreman provides access to a Buildbot CI server. \
                 Use list_builders to see builders and their last results, \
                 list_running_builds to find builds in progress and stop_build to stop one. \
                 Use list_force_schedulers to see which parameters a build accepts and \
                 force_build to start one. Start with 'ping' to verify connectivity."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

// ============================================================================
// Formatting Helpers
// ============================================================================

fn format_builder_list(builders: &[Builder], url: &str) -> String {
    if builders.is_empty() {
        return "No active builders found.".to_string();
    }

    let mut output = format!("Found {} builder(s):\n\n", builders.len());
    for builder in builders {
        let _ = write!(output, "- [{}] {}", builder.builderid, builder.name);
        if let Some(build) = &builder.last_build {
            let _ = write!(output, " | last build {}", build.summary());
        }
        output.push('\n');
        if let Some(description) = builder.description.as_deref().filter(|d| !d.is_empty()) {
            let _ = writeln!(output, "  {}", description);
        }
    }
    let _ = write!(output, "\nWeb UI: {}", builders_page(url));
    output
}

fn format_running_builds(builds: &[Build], builders: &[Builder], url: &str) -> String {
    if builds.is_empty() {
        return "No builds are running.".to_string();
    }

    let mut output = format!("Found {} running build(s):\n\n", builds.len());
    for build in builds {
        let _ = writeln!(
            output,
            "- build ID {}: {} (started {})\n  {}",
            build.buildid,
            commands::build_choice(build, builders),
            build.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            build_page(url, build)
        );
    }
    output
}

fn format_scheduler_list(schedulers: &[ForceScheduler]) -> Result<String, ForemanError> {
    if schedulers.is_empty() {
        return Ok("No force schedulers found.".to_string());
    }

    let mut output = format!("Found {} force scheduler(s):\n", schedulers.len());
    for scheduler in schedulers {
        let _ = write!(
            output,
            "\n{} ({})\n  Builders: {}\n",
            scheduler.name,
            scheduler.display_label(),
            scheduler.builder_names.join(", ")
        );

        let fields = resolve_fields(&scheduler.all_fields)?;
        if fields.editable.is_empty() {
            output.push_str("  Parameters: none\n");
            continue;
        }
        output.push_str("  Parameters:\n");
        for field in &fields.editable {
            let _ = write!(output, "  - {}", field.name);
            if !field.label.is_empty() && field.label != field.name {
                let _ = write!(output, " \"{}\"", field.label);
            }
            if let Some(default) = field.value_text().filter(|d| !d.is_empty()) {
                let _ = write!(output, " (default: {})", default);
            }
            if field.required {
                output.push_str(" [required]");
            }
            output.push('\n');
        }
    }
    Ok(output)
}

fn format_force_result(forced: &ForcedBuild) -> String {
    let mut output = format!(
        "Build of {} forced through scheduler {}.\n",
        forced.builder, forced.scheduler
    );

    let parameters: Vec<String> = forced
        .parameters
        .iter()
        .filter(|(name, _)| name.as_str() != "builderid")
        .map(|(name, value)| match value {
            serde_json::Value::String(s) => format!("{}={}", name, s),
            other => format!("{}={}", name, other),
        })
        .collect();
    if !parameters.is_empty() {
        let _ = writeln!(output, "Parameters: {}", parameters.join(", "));
    }

    if let Some(brid) = forced.result.get(0).and_then(|v| v.as_u64()) {
        let _ = writeln!(output, "Build request: {}", brid);
    }
    let _ = write!(output, "Web UI: {}", forced.web_url);
    output
}

fn format_stop_result(stopped: &StoppedBuild) -> String {
    format!(
        "Stop requested for build #{} (ID {}).\nWeb UI: {}",
        stopped.build.number, stopped.build.buildid, stopped.web_url
    )
}
