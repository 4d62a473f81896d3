//! Operator commands built on [`ApiClient`].
//!
//! Each command lists what the server offers, lets the operator choose
//! through a [`Prompt`], and performs the action. A cancelled choice or a
//! declined login ends the command with `Ok(None)`.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::client::ApiClient;
use crate::error::ForemanError;
use crate::models::{resolve_fields, Build, Builder, ForceScheduler, ResolvedFields};
use crate::session::Prompt;

/// A build forced through a scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct ForcedBuild {
    /// Builder the build was forced on.
    pub builder: String,
    /// Scheduler used.
    pub scheduler: String,
    /// Parameters sent.
    pub parameters: Map<String, Value>,
    /// Control call result (build request IDs).
    pub result: Value,
    /// Web UI page of the builder.
    pub web_url: String,
}

/// A stopped build.
#[derive(Debug, Clone, PartialEq)]
pub struct StoppedBuild {
    /// The build as it was before stopping.
    pub build: Build,
    /// Web UI page of the build.
    pub web_url: String,
}

/// Label a builder is offered under.
pub fn builder_choice(builder: &Builder) -> String {
    match &builder.last_build {
        Some(build) => format!("{} (last: {})", builder.name, build.summary()),
        None => builder.name.clone(),
    }
}

/// Label a running build is offered under.
pub fn build_choice(build: &Build, builders: &[Builder]) -> String {
    let builder = builders
        .iter()
        .find(|b| b.builderid == build.builderid)
        .map_or("unknown builder", |b| b.name.as_str());
    format!("{} #{}: {}", builder, build.number, build.display_state())
}

async fn choose_index(
    prompt: &dyn Prompt,
    options: &[String],
    placeholder: &str,
) -> Option<usize> {
    let choice = prompt.choose(options, Some(placeholder)).await?;
    options.iter().position(|o| *o == choice)
}

/// Lets the operator pick an active builder.
pub async fn pick_builder(
    client: &ApiClient,
    prompt: &dyn Prompt,
) -> Result<Option<Builder>, ForemanError> {
    let Some(mut builders) = client.list_builders_with_last_build().await? else {
        return Ok(None);
    };
    if builders.is_empty() {
        return Err(ForemanError::validation("the server has no active builders"));
    }

    let options: Vec<String> = builders.iter().map(builder_choice).collect();
    Ok(choose_index(prompt, &options, "Select a builder")
        .await
        .map(|index| builders.swap_remove(index)))
}

/// Lets the operator pick a running build, optionally of one builder.
pub async fn pick_running_build(
    client: &ApiClient,
    prompt: &dyn Prompt,
    builderid: Option<u64>,
) -> Result<Option<Build>, ForemanError> {
    let Some(mut builds) = client.running_builds(builderid).await? else {
        return Ok(None);
    };
    if builds.is_empty() {
        return Err(ForemanError::validation("no build is running"));
    }
    let Some(builders) = client.list_builders().await? else {
        return Ok(None);
    };

    let options: Vec<String> = builds.iter().map(|b| build_choice(b, &builders)).collect();
    Ok(choose_index(prompt, &options, "Select a build to stop")
        .await
        .map(|index| builds.swap_remove(index)))
}

/// Asks the operator for every editable parameter, defaults pre-filled.
///
/// Returns `None` if a question is cancelled or a required value is left
/// empty.
pub async fn collect_force_parameters(
    prompt: &dyn Prompt,
    fields: &ResolvedFields,
) -> Option<HashMap<String, String>> {
    let mut values = HashMap::new();

    for field in &fields.editable {
        let default = field.value_text();
        let label = if field.label.is_empty() { &field.name } else { &field.label };
        let answer = prompt.ask_text(label, default.as_deref()).await?;

        if answer.is_empty() && field.required {
            tracing::debug!(field = %field.name, "Required force parameter left empty");
            return None;
        }
        values.insert(field.name.clone(), answer);
    }

    Some(values)
}

/// Looks up an active builder by name.
pub async fn find_builder(
    client: &ApiClient,
    name: &str,
) -> Result<Option<Builder>, ForemanError> {
    let Some(builders) = client.list_builders().await? else {
        return Ok(None);
    };
    builders
        .into_iter()
        .find(|b| b.name == name)
        .map(Some)
        .ok_or_else(|| ForemanError::validation(format!("no active builder named '{}'", name)))
}

/// Picks the only scheduler able to force `builder`.
pub fn select_scheduler(
    mut schedulers: Vec<ForceScheduler>,
    builder: &str,
) -> Result<ForceScheduler, ForemanError> {
    match schedulers.len() {
        0 => Err(ForemanError::validation(format!(
            "no force scheduler can build '{}'",
            builder
        ))),
        1 => Ok(schedulers.remove(0)),
        _ => Err(ForemanError::validation(format!(
            "several force schedulers can build '{}': {}",
            builder,
            schedulers
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

async fn submit_force(
    client: &ApiClient,
    builder: &Builder,
    scheduler: &ForceScheduler,
    fields: &ResolvedFields,
    values: &HashMap<String, String>,
) -> Result<Option<ForcedBuild>, ForemanError> {
    let owner = client.user().await.unwrap_or_default();
    let parameters = fields.parameters(values, builder.builderid, &owner);

    let Some(result) = client.force_build(&scheduler.name, parameters.clone()).await? else {
        return Ok(None);
    };
    tracing::info!(builder = %builder.name, scheduler = %scheduler.name, "Build forced");

    Ok(Some(ForcedBuild {
        builder: builder.name.clone(),
        scheduler: scheduler.name.clone(),
        parameters,
        result,
        web_url: client.builder_web_url(builder.builderid).await,
    }))
}

/// Forces a build with parameter values supplied up front.
///
/// A named scheduler is fetched directly. Without a name, the builder must
/// have exactly one.
///
/// # Errors
///
/// Returns `ForemanError::Validation` for an unknown builder, an ambiguous
/// or unsuitable scheduler, values for fields that are not editable, or
/// missing required parameters.
pub async fn force_with_values(
    client: &ApiClient,
    builder_name: &str,
    scheduler: Option<&str>,
    values: &HashMap<String, String>,
) -> Result<Option<ForcedBuild>, ForemanError> {
    let Some(builder) = find_builder(client, builder_name).await? else {
        return Ok(None);
    };
    let scheduler = match scheduler {
        Some(name) => {
            let Some(scheduler) = client.force_scheduler(name).await? else {
                return Ok(None);
            };
            if !scheduler.targets(&builder.name) {
                return Err(ForemanError::validation(format!(
                    "force scheduler '{}' cannot build '{}'",
                    name, builder.name
                )));
            }
            scheduler
        }
        None => {
            let Some(schedulers) = client.force_schedulers(Some(&builder.name)).await? else {
                return Ok(None);
            };
            select_scheduler(schedulers, &builder.name)?
        }
    };
    let fields = resolve_fields(&scheduler.all_fields)?;

    let unexpected = fields.unexpected_values(values);
    if !unexpected.is_empty() {
        return Err(ForemanError::validation(format!(
            "parameters not editable on scheduler '{}': {}",
            scheduler.name,
            unexpected.join(", ")
        )));
    }

    let missing = fields.missing_required(values);
    if !missing.is_empty() {
        return Err(ForemanError::validation(format!(
            "missing required parameters: {}",
            missing.join(", ")
        )));
    }

    submit_force(client, &builder, &scheduler, &fields, values).await
}

/// Picks a builder and a scheduler, asks for the parameters and forces a build.
pub async fn force_build(
    client: &ApiClient,
    prompt: &dyn Prompt,
) -> Result<Option<ForcedBuild>, ForemanError> {
    let Some(builder) = pick_builder(client, prompt).await? else {
        return Ok(None);
    };
    let Some(mut schedulers) = client.force_schedulers(Some(&builder.name)).await? else {
        return Ok(None);
    };

    let scheduler = if schedulers.len() > 1 {
        let options: Vec<String> = schedulers
            .iter()
            .map(|s| s.display_label().to_string())
            .collect();
        match choose_index(prompt, &options, "Select a force scheduler").await {
            Some(index) => schedulers.swap_remove(index),
            None => return Ok(None),
        }
    } else {
        select_scheduler(schedulers, &builder.name)?
    };

    let fields = resolve_fields(&scheduler.all_fields)?;
    let Some(values) = collect_force_parameters(prompt, &fields).await else {
        return Ok(None);
    };

    submit_force(client, &builder, &scheduler, &fields, &values).await
}

/// Stops a build, by ID or picked from the running builds.
pub async fn stop_build(
    client: &ApiClient,
    prompt: &dyn Prompt,
    buildid: Option<u64>,
    reason: Option<&str>,
) -> Result<Option<StoppedBuild>, ForemanError> {
    let build = match buildid {
        Some(id) => client.get_build(id).await?,
        None => pick_running_build(client, prompt, None).await?,
    };
    let Some(build) = build else {
        return Ok(None);
    };

    if build.complete() {
        return Err(ForemanError::validation(format!(
            "build {} has already finished",
            build.buildid
        )));
    }

    if client.stop_build(build.buildid, reason).await?.is_none() {
        return Ok(None);
    }
    tracing::info!(buildid = build.buildid, "Build stopped");

    let web_url = client.build_web_url(&build).await;
    Ok(Some(StoppedBuild { build, web_url }))
}
