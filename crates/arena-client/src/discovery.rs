//! Catalog and server-action discovery.
//!
//! The model catalog and the two server-action identifiers the uploader
//! needs are not served by any API; they are embedded in the rendered
//! page. Models come from the framework hydration payload (`initialModels`
//! inside `self.__next_f.push` scripts); action identifiers come from the
//! script bundle the hydration payload's dynamic-import table points at.
//!
//! Everything here is best-effort: parse failures are logged and the state
//! stays partial so a later `ensure_loaded` call can retry.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use arena_core::config::ArenaConfig;
use arena_core::session::Session;
use arena_core::Result;

use crate::transport;

/// Hydration-tree tags whose subtrees never carry application state.
const SKIP_TAGS: &[&str] = &["div", "defs", "style", "script"];

const HYDRATION_PREFIX: &str = "self.__next_f.push(";

static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]+:(.*)$").unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

static ACTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\("([a-f0-9]{40,})".*?"(\w+)"\)"#)
        .unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

/// The two server-action identifiers uploads require.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ActionIds {
    /// Identifier of the upload-URL-minting action.
    pub generate_upload_url: Option<String>,
    /// Identifier of the signed-URL-resolving action.
    pub get_signed_url: Option<String>,
}

impl ActionIds {
    /// Both identifiers are known.
    #[must_use]
    pub fn complete(&self) -> bool {
        self.generate_upload_url.is_some() && self.get_signed_url.is_some()
    }
}

#[derive(Default)]
struct State {
    text_models: BTreeMap<String, String>,
    image_models: BTreeMap<String, String>,
    vision_models: BTreeSet<String>,
    models: Vec<String>,
    default_model: String,
    actions: ActionIds,
    models_loaded: bool,
}

impl State {
    fn loaded(&self) -> bool {
        self.models_loaded && self.actions.complete()
    }
}

/// Process-lifetime discovery state. Reads are lock-free once populated;
/// loading is serialized by a gate so concurrent callers coalesce.
pub struct Discovery {
    config: ArenaConfig,
    session: Arc<dyn Session>,
    state: RwLock<State>,
    load_gate: Mutex<()>,
}

impl Discovery {
    /// Create an unloaded discovery over `session`.
    #[must_use]
    pub fn new(config: ArenaConfig, session: Arc<dyn Session>) -> Self {
        Self {
            config,
            session,
            state: RwLock::new(State::default()),
            load_gate: Mutex::new(()),
        }
    }

    /// Load the catalog and action identifiers if either is missing.
    ///
    /// Returns `Ok(())` even when parsing comes up empty; callers that
    /// need the actions check [`Discovery::action_ids`] and fail there.
    #[tracing::instrument(skip_all)]
    pub async fn ensure_loaded(&self) -> Result<()> {
        if self.state.read().await.loaded() {
            return Ok(());
        }
        let _gate = self.load_gate.lock().await;
        if self.state.read().await.loaded() {
            return Ok(());
        }

        self.session.ensure_ready(false).await?;
        let html = self.session.rendered_markup().await.unwrap_or_default();
        if html.is_empty() {
            tracing::warn!("rendered markup was empty, discovery deferred");
            return Ok(());
        }

        let lines = hydration_lines(&html);
        tracing::debug!(lines = lines.len(), "extracted hydration payload lines");

        if !self.state.read().await.models_loaded {
            match parse_catalog(&lines) {
                Some(catalog) => {
                    let mut state = self.state.write().await;
                    tracing::info!(models = catalog.models.len(), "loaded model catalog");
                    state.text_models = catalog.text_models;
                    state.image_models = catalog.image_models;
                    state.vision_models = catalog.vision_models;
                    state.models = catalog.models;
                    state.default_model = catalog.default_model;
                    state.models_loaded = !state.models.is_empty();
                }
                None => tracing::warn!("no model catalog in hydration payload"),
            }
        }

        if !self.state.read().await.actions.complete() {
            self.load_actions(&lines).await;
        }
        Ok(())
    }

    /// Fetch bundle candidates from the dynamic-import table until one
    /// yields both action identifiers. Network failures skip to the next
    /// candidate.
    async fn load_actions(&self, lines: &[String]) {
        let candidates = evaluation_bundle_paths(lines);
        if candidates.is_empty() {
            tracing::warn!("no bundle candidates in hydration payload");
            return;
        }

        let creds = match self.session.credential_snapshot().await {
            Ok(creds) => creds,
            Err(e) => {
                tracing::warn!(error = %e, "credential snapshot failed, actions deferred");
                return;
            }
        };
        let client = match transport::build_client(Duration::from_secs(60)) {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(error = %e, "client build failed, actions deferred");
                return;
            }
        };

        // Later entries tend to be the most specific bundle.
        for path in candidates.iter().rev() {
            let url = format!("{}/_next/{path}", self.config.origin_trimmed());
            let body: Result<String> = async {
                let response = transport::apply_credentials(client.get(&url), &creds)
                    .send()
                    .await?;
                Ok(transport::ensure_ok(response).await?.text().await?)
            }
            .await;

            let js = match body {
                Ok(js) => js,
                Err(e) => {
                    tracing::debug!(url, error = %e, "bundle fetch failed");
                    continue;
                }
            };

            let mut state = self.state.write().await;
            if scan_bundle(&js, &mut state.actions) {
                tracing::info!(url, "loaded server action identifiers");
                return;
            }
        }
        tracing::warn!("no bundle yielded both action identifiers");
    }

    /// Resolve a model name to its catalog id, text models first.
    pub async fn resolve_model_id(&self, name: &str) -> Option<String> {
        let state = self.state.read().await;
        state
            .text_models
            .get(name)
            .or_else(|| state.image_models.get(name))
            .cloned()
    }

    /// Whether `name` produces images rather than text.
    pub async fn is_image_output_model(&self, name: &str) -> bool {
        self.state.read().await.image_models.contains_key(name)
    }

    /// Whether `name` accepts image input.
    pub async fn supports_vision_input(&self, name: &str) -> bool {
        self.state.read().await.vision_models.contains(name)
    }

    /// The default model: the lexicographically smallest text-capable
    /// name. Empty until the catalog loads.
    pub async fn default_model(&self) -> String {
        self.state.read().await.default_model.clone()
    }

    /// Every known model name, sorted.
    pub async fn model_names(&self) -> Vec<String> {
        self.state.read().await.models.clone()
    }

    /// The current action identifiers, possibly incomplete.
    pub async fn action_ids(&self) -> ActionIds {
        self.state.read().await.actions.clone()
    }

    #[cfg(test)]
    pub(crate) async fn seed(
        &self,
        text_models: &[(&str, &str)],
        image_models: &[(&str, &str)],
        vision_models: &[&str],
        actions: ActionIds,
    ) {
        let mut state = self.state.write().await;
        state.text_models = text_models
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        state.image_models = image_models
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        state.vision_models = vision_models.iter().map(|s| (*s).to_string()).collect();
        state.models = state
            .text_models
            .keys()
            .chain(state.image_models.keys())
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        state.default_model = state
            .text_models
            .keys()
            .next()
            .cloned()
            .unwrap_or_default();
        state.actions = actions;
        state.models_loaded = true;
    }
}

struct Catalog {
    text_models: BTreeMap<String, String>,
    image_models: BTreeMap<String, String>,
    vision_models: BTreeSet<String>,
    models: Vec<String>,
    default_model: String,
}

/// Pull the framework's streamed hydration lines out of rendered markup.
///
/// Each `<script>` of the form `self.__next_f.push([n, "..."])` carries a
/// string of newline-separated `<hex-id>:<payload>` records; the payloads
/// are returned in document order.
fn hydration_lines(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let Ok(selector) = Selector::parse("script") else {
        return Vec::new();
    };

    let mut lines = Vec::new();
    for script in document.select(&selector) {
        let text: String = script.text().collect();
        let trimmed = text.trim();
        let Some(rest) = trimmed.strip_prefix(HYDRATION_PREFIX) else {
            continue;
        };
        let Some(payload) = rest.strip_suffix(')') else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(payload) else {
            continue;
        };
        let Some(data) = value.get(1).and_then(Value::as_str) else {
            continue;
        };
        for chunk in data.split('\n') {
            if let Some(captures) = LINE_RE.captures(chunk) {
                if let Some(body) = captures.get(1) {
                    lines.push(body.as_str().to_string());
                }
            }
        }
    }
    lines
}

/// Find `initialModels` in the hydration payload and derive the catalog.
fn parse_catalog(lines: &[String]) -> Option<Catalog> {
    for line in lines {
        if !(line.starts_with('[') || line.starts_with('{')) {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if let Some(models) = find_initial_models(&value) {
            return Some(derive_catalog(models));
        }
    }
    None
}

/// Recursive walk of the tagged hydration tree. Element nodes look like
/// `["$", tag, key, props]`; presentation-only subtrees are skipped.
fn find_initial_models(value: &Value) -> Option<&Vec<Value>> {
    let props = match value {
        Value::Object(_) => value,
        Value::Array(arr) if arr.first().and_then(Value::as_str) == Some("$") => {
            if is_skipped_tag(arr.get(1)) {
                return None;
            }
            arr.get(3)?
        }
        _ => return None,
    };

    if let Some(models) = props.get("initialModels").and_then(Value::as_array) {
        return Some(models);
    }
    if let Some(children) = props.get("children") {
        return walk_children(children);
    }
    None
}

fn walk_children(children: &Value) -> Option<&Vec<Value>> {
    let arr = children.as_array()?;
    if arr.len() < 4 {
        return None;
    }
    if is_skipped_tag(arr.get(1)) {
        return None;
    }
    if arr.first().and_then(Value::as_str) == Some("$") {
        return find_initial_models(arr.get(3)?);
    }
    for child in arr {
        if let Some(element) = child.as_array()
            && element.len() >= 4
            && let Some(found) = find_initial_models(element.get(3)?)
        {
            return Some(found);
        }
    }
    None
}

fn is_skipped_tag(tag: Option<&Value>) -> bool {
    tag.and_then(Value::as_str)
        .is_some_and(|t| SKIP_TAGS.contains(&t))
}

/// Partition the raw model list by capability.
fn derive_catalog(model_list: &[Value]) -> Catalog {
    let mut text_models = BTreeMap::new();
    let mut image_models = BTreeMap::new();
    let mut vision_models = BTreeSet::new();

    for model in model_list {
        let (Some(name), Some(id)) = (
            model.get("publicName").and_then(Value::as_str),
            model.get("id").and_then(Value::as_str),
        ) else {
            continue;
        };
        let capabilities = model.get("capabilities");
        let output = capabilities.and_then(|c| c.get("outputCapabilities"));
        let input = capabilities.and_then(|c| c.get("inputCapabilities"));

        if output.is_some_and(|o| o.get("text").is_some()) {
            let _ = text_models.insert(name.to_string(), id.to_string());
        }
        if output.is_some_and(|o| o.get("image").is_some()) {
            let _ = image_models.insert(name.to_string(), id.to_string());
        }
        if input.is_some_and(|i| i.get("image").is_some()) {
            let _ = vision_models.insert(name.to_string());
        }
    }

    let models: Vec<String> = text_models
        .keys()
        .chain(image_models.keys())
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let default_model = text_models
        .keys()
        .next()
        .or_else(|| models.first())
        .cloned()
        .unwrap_or_default();

    Catalog {
        text_models,
        image_models,
        vision_models,
        models,
        default_model,
    }
}

/// Bundle paths from dynamic-import records tagged `"Evaluation"`.
///
/// An import record is a hydration line of the form
/// `I[module, [chunk-id, path, chunk-id, path, ...], "Evaluation", ...]`;
/// the odd entries of the file table are the fetchable paths.
fn evaluation_bundle_paths(lines: &[String]) -> Vec<String> {
    let mut paths = Vec::new();
    for line in lines {
        let Some(rest) = line.strip_prefix('I') else {
            continue;
        };
        if !rest.starts_with('[') {
            continue;
        }
        let Ok(record) = serde_json::from_str::<Value>(rest) else {
            continue;
        };
        let Some(arr) = record.as_array() else {
            continue;
        };
        if arr.len() < 3 || arr.get(2).and_then(Value::as_str) != Some("Evaluation") {
            continue;
        }
        if let Some(files) = arr.get(1).and_then(Value::as_array) {
            paths.extend(
                files
                    .iter()
                    .skip(1)
                    .step_by(2)
                    .filter_map(Value::as_str)
                    .map(str::to_owned),
            );
        }
    }
    paths
}

/// Scan one bundle for action identifiers; returns true when the bundle
/// completed the set.
fn scan_bundle(js: &str, actions: &mut ActionIds) -> bool {
    if !js.contains("generateUploadUrl") {
        return false;
    }
    for captures in ACTION_RE.captures_iter(js) {
        let (Some(id), Some(name)) = (captures.get(1), captures.get(2)) else {
            continue;
        };
        match name.as_str() {
            "generateUploadUrl" => actions.generate_upload_url = Some(id.as_str().to_string()),
            "getSignedUrl" => actions.get_signed_url = Some(id.as_str().to_string()),
            _ => {}
        }
    }
    actions.complete()
}
