use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use easel_contracts::prompts::PromptPair;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use rand::Rng;
use reqwest::blocking::multipart::Form as MultipartForm;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::truncate_text;
use crate::expander::{http_client, response_json_or_error};

const MAX_SEED: u64 = 999_999_999_999_999;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisRequest {
    pub prompt: PromptPair,
    pub width: u32,
    pub height: u32,
    pub reference_image: Option<PathBuf>,
}

/// Renders one batch of images for a prompt pair.
///
/// Returns encoded image bytes in the order the render engine produced them.
pub trait ImageSynthesizer: Send + Sync {
    fn name(&self) -> &str;
    fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<Vec<u8>>>;
}

#[derive(Debug, Clone)]
pub struct ComfyUiConfig {
    pub server: String,
    pub workflow_path: PathBuf,
    pub positive_node: String,
    pub negative_node: String,
    pub seed_nodes: Vec<String>,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
}

impl ComfyUiConfig {
    pub fn new(server: impl Into<String>, workflow_path: impl Into<PathBuf>) -> Self {
        Self {
            server: server.into(),
            workflow_path: workflow_path.into(),
            positive_node: "3".to_string(),
            negative_node: "4".to_string(),
            seed_nodes: vec!["5".to_string(), "11".to_string()],
            poll_interval: Duration::from_secs(1),
            poll_timeout: Duration::from_secs(600),
        }
    }
}

/// Drives a ComfyUI server: submit a workflow, poll its history entry, then
/// fetch every output image.
pub struct ComfyUiSynthesizer {
    api_base: String,
    workflow: Map<String, Value>,
    config: ComfyUiConfig,
    client_id: String,
    http: HttpClient,
}

impl ComfyUiSynthesizer {
    pub fn new(config: ComfyUiConfig) -> Result<Self> {
        let raw = std::fs::read_to_string(&config.workflow_path).with_context(|| {
            format!(
                "failed reading ComfyUI workflow {}",
                config.workflow_path.display()
            )
        })?;
        let workflow = serde_json::from_str::<Value>(&raw)
            .with_context(|| format!("invalid workflow JSON {}", config.workflow_path.display()))?
            .as_object()
            .cloned()
            .ok_or_else(|| anyhow!("workflow must be a JSON object of nodes"))?;
        let server = config.server.trim().trim_end_matches('/');
        let api_base = if server.starts_with("http://") || server.starts_with("https://") {
            server.to_string()
        } else {
            format!("http://{server}")
        };
        Ok(Self {
            api_base,
            workflow,
            client_id: Uuid::new_v4().to_string(),
            config,
            http: http_client()?,
        })
    }

    fn upload_reference(&self, path: &Path) -> Result<String> {
        let endpoint = format!("{}/upload/image", self.api_base);
        let form = MultipartForm::new()
            .text("overwrite", "true")
            .file("image", path)
            .with_context(|| format!("failed reading reference image {}", path.display()))?;
        let response = self
            .http
            .post(&endpoint)
            .multipart(form)
            .send()
            .with_context(|| format!("ComfyUI upload failed ({endpoint})"))?;
        let payload = response_json_or_error("ComfyUI upload", response)?;
        let name = payload
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("ComfyUI upload response had no name: {payload}"))?;
        Ok(match payload.get("subfolder").and_then(Value::as_str) {
            Some(subfolder) if !subfolder.is_empty() => format!("{subfolder}/{name}"),
            _ => name.to_string(),
        })
    }

    fn submit(&self, workflow: &Map<String, Value>) -> Result<String> {
        let endpoint = format!("{}/prompt", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .json(&json!({"prompt": workflow, "client_id": self.client_id}))
            .send()
            .with_context(|| format!("ComfyUI submit failed ({endpoint})"))?;
        let payload = response_json_or_error("ComfyUI submit", response)?;
        if let Some(error) = payload.get("error") {
            bail!("ComfyUI rejected workflow: {}", truncate_text(&error.to_string(), 512));
        }
        payload
            .get("prompt_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("ComfyUI submit response had no prompt_id: {payload}"))
    }

    fn poll_history(&self, job_id: &str) -> Result<Value> {
        let endpoint = format!("{}/history/{job_id}", self.api_base);
        let started = Instant::now();
        loop {
            let response = self
                .http
                .get(&endpoint)
                .send()
                .with_context(|| format!("ComfyUI poll request failed ({endpoint})"))?;
            let payload = response_json_or_error("ComfyUI poll", response)?;
            if let Some(entry) = payload.get(job_id) {
                let status = entry
                    .pointer("/status/status_str")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if status == "error" {
                    bail!("ComfyUI job {job_id} failed: {}", truncate_text(&entry.to_string(), 512));
                }
                return Ok(entry.clone());
            }
            if started.elapsed() >= self.config.poll_timeout {
                bail!(
                    "ComfyUI polling timed out after {:.1}s",
                    self.config.poll_timeout.as_secs_f64()
                );
            }
            thread::sleep(self.config.poll_interval);
        }
    }

    fn fetch_image(&self, output: &Value) -> Result<Vec<u8>> {
        let field = |key: &str| output.get(key).and_then(Value::as_str).unwrap_or_default();
        let filename = field("filename");
        if filename.is_empty() {
            bail!("ComfyUI output entry had no filename: {output}");
        }
        let endpoint = format!("{}/view", self.api_base);
        let response = self
            .http
            .get(&endpoint)
            .query(&[
                ("filename", filename),
                ("subfolder", field("subfolder")),
                ("type", field("type")),
            ])
            .send()
            .with_context(|| format!("ComfyUI image download failed ({filename})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "ComfyUI image download failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        Ok(response
            .bytes()
            .context("failed reading ComfyUI image bytes")?
            .to_vec())
    }
}

impl ImageSynthesizer for ComfyUiSynthesizer {
    fn name(&self) -> &str {
        "comfyui"
    }

    fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<Vec<u8>>> {
        let mut workflow = self.workflow.clone();
        let uploaded = request
            .reference_image
            .as_deref()
            .map(|path| self.upload_reference(path))
            .transpose()?;
        prepare_workflow(
            &mut workflow,
            &self.config,
            request,
            uploaded.as_deref(),
            &mut rand::thread_rng(),
        );

        let job_id = self.submit(&workflow)?;
        tracing::debug!(job_id = %job_id, "ComfyUI job queued");
        let entry = self.poll_history(&job_id)?;

        let mut images = Vec::new();
        if let Some(outputs) = entry.get("outputs").and_then(Value::as_object) {
            for node_output in outputs.values() {
                let Some(rows) = node_output.get("images").and_then(Value::as_array) else {
                    continue;
                };
                for row in rows {
                    images.push(self.fetch_image(row)?);
                }
            }
        }
        if images.is_empty() {
            bail!("ComfyUI job {job_id} produced no images");
        }
        Ok(images)
    }
}

/// Injects prompt text, size, fresh seeds and the uploaded reference image
/// into a copy of the workflow template.
fn prepare_workflow(
    workflow: &mut Map<String, Value>,
    config: &ComfyUiConfig,
    request: &SynthesisRequest,
    reference_name: Option<&str>,
    rng: &mut impl Rng,
) {
    set_node_input(
        workflow,
        &config.positive_node,
        "text",
        json!(request.prompt.positive),
    );
    set_node_input(
        workflow,
        &config.negative_node,
        "text",
        json!(request.prompt.negative),
    );
    for node in &config.seed_nodes {
        let has_seed = workflow
            .get(node)
            .and_then(|value| value.pointer("/inputs/seed"))
            .is_some();
        if has_seed {
            set_node_input(workflow, node, "seed", json!(rng.gen_range(0..=MAX_SEED)));
        }
    }
    for node in workflow.values_mut() {
        let class_type = node
            .get("class_type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) else {
            continue;
        };
        if inputs.contains_key("width") && inputs.contains_key("height") {
            inputs.insert("width".to_string(), json!(request.width));
            inputs.insert("height".to_string(), json!(request.height));
        }
        if let (Some(name), "LoadImage") = (reference_name, class_type.as_str()) {
            inputs.insert("image".to_string(), json!(name));
        }
    }
}

fn set_node_input(workflow: &mut Map<String, Value>, node: &str, key: &str, value: Value) {
    if let Some(inputs) = workflow
        .get_mut(node)
        .and_then(|node| node.get_mut("inputs"))
        .and_then(Value::as_object_mut)
    {
        inputs.insert(key.to_string(), value);
    }
}

/// Offline synthesizer rendering flat-colour PNGs derived from the prompt.
#[derive(Debug, Clone, Copy)]
pub struct DryrunSynthesizer {
    batch_size: usize,
}

impl DryrunSynthesizer {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }
}

impl Default for DryrunSynthesizer {
    fn default() -> Self {
        Self::new(1)
    }
}

impl ImageSynthesizer for DryrunSynthesizer {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<Vec<u8>>> {
        if request.width == 0 || request.height == 0 {
            bail!("image size must be positive, got {}x{}", request.width, request.height);
        }
        let base = match &request.reference_image {
            Some(path) => Some(
                image::open(path)
                    .with_context(|| format!("failed to open reference image {}", path.display()))?
                    .resize_exact(request.width, request.height, FilterType::Triangle)
                    .to_rgb8(),
            ),
            None => None,
        };

        (0..self.batch_size)
            .map(|idx| {
                let (r, g, b) = color_from_prompt(&request.prompt.positive, idx as u64);
                let image = match &base {
                    Some(base) => tint(base, [r, g, b]),
                    None => RgbImage::from_pixel(request.width, request.height, Rgb([r, g, b])),
                };
                encode_png(image)
            })
            .collect()
    }
}

fn tint(base: &RgbImage, color: [u8; 3]) -> RgbImage {
    let mut out = base.clone();
    for pixel in out.pixels_mut() {
        for (channel, tone) in pixel.0.iter_mut().zip(color) {
            *channel = ((u16::from(*channel) + u16::from(tone)) / 2) as u8;
        }
    }
    out
}

fn encode_png(image: RgbImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("failed to encode PNG")?;
    Ok(bytes)
}

fn color_from_prompt(prompt: &str, seed: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}
