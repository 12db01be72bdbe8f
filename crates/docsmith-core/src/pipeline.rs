//! Conversion pipelines: one per route, each running inside its own
//! artifact scope.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::artifact::ArtifactScope;
use crate::html::{self, TidyOptions};
use crate::invoker::{self, Invocation, ToolOutput};
use crate::options::{ConversionOptions, OptionKind, OptionSpec, OptionValue, auto_parse};
use crate::tools::{ALL_TOOLS, ANTIWORD, BinaryPaths, PANDOC, PDFTOHTML, PDFTOTEXT, ToolSpec, UNRTF};
use crate::{ConversionError, ConversionRequest, ConversionResult, mojibake, postprocess};

const DOCX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

/// Options consumed in-process by every HTML-producing route.
pub const PRESENTATION_OPTIONS: &[OptionSpec] = &[
    OptionSpec::new("backgroundColor", "", OptionKind::Text),
    OptionSpec::new("fonts", "", OptionKind::Text),
];

/// One conversion route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    PdfToHtml,
    PdfToTxt,
    DocxToHtml,
    DocxToTxt,
    RtfToHtml,
    RtfToTxt,
    DocToTxt,
    HtmlToTxt,
}

impl Route {
    pub const ALL: [Route; 8] = [
        Route::PdfToHtml,
        Route::PdfToTxt,
        Route::DocxToHtml,
        Route::DocxToTxt,
        Route::RtfToHtml,
        Route::RtfToTxt,
        Route::DocToTxt,
        Route::HtmlToTxt,
    ];

    pub fn path(self) -> &'static str {
        match self {
            Route::PdfToHtml => "/pdf/html",
            Route::PdfToTxt => "/pdf/txt",
            Route::DocxToHtml => "/docx/html",
            Route::DocxToTxt => "/docx/txt",
            Route::RtfToHtml => "/rtf/html",
            Route::RtfToTxt => "/rtf/txt",
            Route::DocToTxt => "/doc/txt",
            Route::HtmlToTxt => "/html/txt",
        }
    }

    /// Look a route up by source format and target (`html` or `txt`).
    pub fn from_formats(source: &str, target: &str) -> Option<Route> {
        let source = source.trim_start_matches('.').to_ascii_lowercase();
        let source = match source.as_str() {
            "htm" => "html",
            other => other,
        };
        let target = match target.to_ascii_lowercase().as_str() {
            "text" | "txt" => "txt",
            "html" => "html",
            _ => return None,
        };
        let path = format!("/{source}/{target}");
        Route::ALL.into_iter().find(|r| r.path() == path)
    }

    /// Extension the payload is written under.
    pub fn input_extension(self) -> &'static str {
        match self {
            Route::PdfToHtml | Route::PdfToTxt => "pdf",
            Route::DocxToHtml | Route::DocxToTxt => "docx",
            Route::RtfToHtml | Route::RtfToTxt => "rtf",
            Route::DocToTxt => "doc",
            Route::HtmlToTxt => "html",
        }
    }

    pub fn accepted_content_types(self) -> &'static [&'static str] {
        match self {
            Route::PdfToHtml | Route::PdfToTxt => &["application/pdf"],
            Route::DocxToHtml | Route::DocxToTxt => &[DOCX_CONTENT_TYPE],
            Route::RtfToHtml | Route::RtfToTxt => &["application/rtf", "text/rtf"],
            Route::DocToTxt => &["application/msword"],
            Route::HtmlToTxt => &["text/html"],
        }
    }

    /// The media type a request with `params` will be answered with.
    pub fn response_type(self, params: &BTreeMap<String, String>) -> &'static str {
        let html_meta = params
            .get("generateHtmlMetaFile")
            .is_some_and(|v| matches!(auto_parse(v), OptionValue::Bool(true)));
        match self {
            Route::PdfToTxt if html_meta => "text/html",
            r if r.produces_html() => "text/html",
            _ => "text/plain",
        }
    }

    pub fn produces_html(self) -> bool {
        matches!(
            self,
            Route::PdfToHtml | Route::DocxToHtml | Route::RtfToHtml
        )
    }

    /// Check the payload's leading bytes against the declared format.
    pub fn matches_magic(self, payload: &[u8]) -> bool {
        match self {
            Route::PdfToHtml | Route::PdfToTxt => payload.starts_with(b"%PDF-"),
            Route::DocxToHtml | Route::DocxToTxt => payload.starts_with(b"PK\x03\x04"),
            Route::RtfToHtml | Route::RtfToTxt => payload.starts_with(b"{\\rtf"),
            Route::DocToTxt => {
                payload.starts_with(&[0xd0, 0xcf, 0x11, 0xe0, 0xa1, 0xb1, 0x1a, 0xe1])
            }
            Route::HtmlToTxt => html::looks_like_html(&String::from_utf8_lossy(payload)),
        }
    }

    /// External tool backing the route; `None` for in-process routes.
    pub fn tool(self) -> Option<&'static ToolSpec> {
        match self {
            Route::PdfToHtml => Some(&PDFTOHTML),
            Route::PdfToTxt => Some(&PDFTOTEXT),
            Route::DocxToHtml | Route::DocxToTxt => Some(&PANDOC),
            Route::RtfToHtml | Route::RtfToTxt => Some(&UNRTF),
            Route::DocToTxt => Some(&ANTIWORD),
            Route::HtmlToTxt => None,
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.path())
    }
}

/// Reject presentation values that could escape the `<style>` element or
/// the declaration they are written into.
pub fn presentation_options(
    params: &BTreeMap<String, String>,
) -> Result<TidyOptions, ConversionError> {
    let options = ConversionOptions::from_params(PRESENTATION_OPTIONS, &[], params)?;
    for (key, value) in options.iter() {
        let text = value.to_string();
        if text.contains([';', '{', '}', '<', '>']) {
            return Err(ConversionError::InvalidOption {
                key: key.to_string(),
                reason: "must not contain `;`, `{`, `}`, `<` or `>`".to_string(),
            });
        }
    }
    Ok(TidyOptions {
        fonts: options.get_text("fonts").map(str::to_string),
        background_color: options.get_text("backgroundColor").map(str::to_string),
    })
}

/// Drop the `###` banner and the dashed rule unrtf puts above its text.
fn strip_unrtf_banner(text: &str) -> String {
    let mut lines = text.lines().peekable();
    let mut saw_banner = false;
    while let Some(line) = lines.peek() {
        if line.starts_with("###") {
            saw_banner = true;
            lines.next();
        } else {
            break;
        }
    }
    if saw_banner {
        if let Some(line) = lines.peek() {
            if !line.is_empty() && line.chars().all(|c| c == '-') {
                lines.next();
            }
        }
    }
    lines.collect::<Vec<_>>().join("\n").trim().to_string()
}

fn docx_template(id: &str, fragment: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head>\
         <meta content=\"text/html; charset=utf-8\" http-equiv=\"Content-Type\">\
         <title>docsmith_docx-to-html_{id}</title></head>\
         <body><div>{fragment}</div></body></html>"
    )
}

/// Settings shared by every conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConverterConfig {
    /// Directory holding all artifact namespaces.
    pub temp_dir: PathBuf,
    pub binaries: BinaryPaths,
    pub tool_timeout: Duration,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir().join("docsmith"),
            binaries: BinaryPaths::default(),
            tool_timeout: Duration::from_secs(120),
        }
    }
}

/// Outcome of probing one tool.
#[derive(Debug)]
pub struct ToolStatus {
    pub tool: &'static str,
    pub binary: PathBuf,
    pub result: Result<String, ConversionError>,
}

/// Runs conversions. Cheap to clone; holds no per-request state.
#[derive(Debug, Clone, Default)]
pub struct Converter {
    config: ConverterConfig,
}

impl Converter {
    pub fn new(config: ConverterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    /// Convert `request` along `route`.
    ///
    /// Options are validated before anything touches the disk. Once an
    /// artifact scope exists it is cleaned exactly once: here on success or
    /// failure, or by the scope's `Drop` if this future is abandoned.
    pub async fn convert(
        &self,
        route: Route,
        request: &ConversionRequest,
    ) -> Result<ConversionResult, ConversionError> {
        let presentation = if route.produces_html() {
            presentation_options(&request.params)?
        } else {
            TidyOptions::default()
        };

        let Some(tool) = route.tool() else {
            return html_to_text(&request.payload).await;
        };
        let options = ConversionOptions::from_params(tool.options, &tool.defaults(), &request.params)?;

        let started = Instant::now();
        let mut scope = ArtifactScope::allocate(&self.config.temp_dir).await?;
        let result = self
            .run_in_scope(route, tool, &options, presentation, &request.payload, &mut scope)
            .await;

        match &result {
            Ok(_) => scope.mark_normalized(),
            Err(_) => scope.mark_failed(),
        }
        let report = scope.cleanup_async().await;

        match &result {
            Ok(_) => tracing::info!(
                route = route.path(),
                id = scope.handle().id(),
                removed = report.removed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "conversion finished"
            ),
            Err(e) => tracing::info!(
                route = route.path(),
                id = scope.handle().id(),
                removed = report.removed,
                client_error = e.is_client_error(),
                error = %e,
                "conversion failed"
            ),
        }
        result
    }

    async fn run_in_scope(
        &self,
        route: Route,
        tool: &'static ToolSpec,
        options: &ConversionOptions,
        presentation: TidyOptions,
        payload: &[u8],
        scope: &mut ArtifactScope,
    ) -> Result<ConversionResult, ConversionError> {
        let handle = scope.handle().clone();
        let input_name = format!("{}.{}", handle.id(), route.input_extension());
        let input = handle.directory().join(&input_name);
        scope.register(input.clone());
        tokio::fs::write(&input, payload).await.map_err(|e| {
            ConversionError::environment(
                "allocator",
                format!("cannot write {}: {}", input.display(), e),
            )
        })?;

        let invocation = Invocation::new(self.config.binaries.for_tool(tool), self.config.tool_timeout)
            .args(tool.fixed_args.iter().copied())
            .args(options.to_args(tool.options));
        let encoding = options
            .get_text("outputEncoding")
            .unwrap_or("UTF-8")
            .to_string();
        let directory = handle.directory().to_path_buf();

        match route {
            Route::PdfToHtml => {
                let output = handle.with_suffix(".html");
                let invocation = invocation.arg(&input).arg(&output);
                invoker::invoke(tool, &invocation, scope).await?;
                let artifact = handle.with_suffix("-html.html");
                blocking(move || {
                    let html = postprocess::postprocess(&artifact, &encoding)?;
                    let html = html::embed_images(&html, &handle)?;
                    Ok(ConversionResult::html(html::tidy_css(&html, &presentation)))
                })
                .await
            }
            Route::PdfToTxt => {
                let output = handle.with_suffix(".txt");
                let invocation = invocation.arg(&input).arg(&output);
                invoker::invoke(tool, &invocation, scope).await?;
                let as_html = options.get_bool("generateHtmlMetaFile");
                blocking(move || {
                    if as_html {
                        return Ok(ConversionResult::html(postprocess::postprocess(
                            &output, &encoding,
                        )?));
                    }
                    let bytes = std::fs::read(&output).map_err(|e| {
                        ConversionError::environment(
                            "postprocess",
                            format!("cannot read {}: {}", output.display(), e),
                        )
                    })?;
                    let text = postprocess::decode(&bytes, &encoding);
                    Ok(ConversionResult::text(mojibake::fix(&text).into_owned()))
                })
                .await
            }
            Route::DocxToHtml => {
                let media = format!("--extract-media={}-media", handle.id());
                let invocation = invocation
                    .args(["--to", "html", media.as_str()])
                    .arg(&input_name)
                    .current_dir(&directory);
                let out = invoker::invoke(tool, &invocation, scope).await?;
                let id = handle.id().to_string();
                blocking(move || {
                    let fragment = stdout_text(&out);
                    let html = postprocess::normalize_html(&docx_template(&id, &fragment));
                    let html = html::embed_images(&html, &handle)?;
                    Ok(ConversionResult::html(html::tidy_css(&html, &presentation)))
                })
                .await
            }
            Route::DocxToTxt => {
                let invocation = invocation
                    .args(["--to", "plain", "--wrap=none"])
                    .arg(&input);
                let out = invoker::invoke(tool, &invocation, scope).await?;
                Ok(ConversionResult::text(
                    mojibake::fix(stdout_text(&out).trim()).into_owned(),
                ))
            }
            Route::RtfToHtml => {
                let invocation = invocation.arg("--html").arg(&input);
                let out = invoker::invoke(tool, &invocation, scope).await?;
                blocking(move || {
                    let html = postprocess::normalize_html(&stdout_text(&out));
                    Ok(ConversionResult::html(html::tidy_css(&html, &presentation)))
                })
                .await
            }
            Route::RtfToTxt => {
                let invocation = invocation.arg("--text").arg(&input);
                let out = invoker::invoke(tool, &invocation, scope).await?;
                let text = strip_unrtf_banner(&stdout_text(&out));
                Ok(ConversionResult::text(mojibake::fix(&text).into_owned()))
            }
            Route::DocToTxt => {
                let invocation = invocation.arg(&input);
                let out = invoker::invoke(tool, &invocation, scope).await?;
                Ok(ConversionResult::text(
                    mojibake::fix(stdout_text(&out).trim()).into_owned(),
                ))
            }
            Route::HtmlToTxt => html_to_text(payload).await,
        }
    }

    /// Probe every configured tool.
    pub async fn probe_all(&self) -> Vec<ToolStatus> {
        let timeout = self.config.tool_timeout.min(Duration::from_secs(10));
        let mut statuses = Vec::with_capacity(ALL_TOOLS.len());
        for tool in ALL_TOOLS {
            let binary = self.config.binaries.for_tool(tool);
            let result = invoker::probe(tool, &binary, timeout).await;
            statuses.push(ToolStatus {
                tool: tool.name,
                binary,
                result,
            });
        }
        statuses
    }
}

fn stdout_text(out: &ToolOutput) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

async fn blocking<F>(f: F) -> Result<ConversionResult, ConversionError>
where
    F: FnOnce() -> Result<ConversionResult, ConversionError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ConversionError::environment("postprocess", e.to_string()))?
}

async fn html_to_text(payload: &[u8]) -> Result<ConversionResult, ConversionError> {
    let html = String::from_utf8_lossy(payload).into_owned();
    blocking(move || {
        let text = html::html_to_text(&html);
        Ok(ConversionResult::text(mojibake::fix(&text).into_owned()))
    })
    .await
}

/// Extension of `path`, lowercased, for picking a route from a file name.
pub fn source_format(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
}
