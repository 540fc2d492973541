//! Message rendering.
//!
//! The extracted reply is wrapped in the fixed markup template from
//! [`mailbind_core::markup`] and handed to a [`Renderer`], which writes a
//! paginated PDF to a path chosen by the workspace.
//!
//! Two engines are available:
//!
//! - [`BuiltinRenderer`] lays the `<pre>` text out natively with `lopdf`
//!   (Courier, A4, soft wrap at the column limit). No external tools.
//! - [`CommandRenderer`] runs an external HTML-to-PDF program such as
//!   `weasyprint` or `wkhtmltopdf`.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::future::Future;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};
use quick_xml::events::Event;

use mailbind_core::markup::message_markup;

use crate::config::{RenderConfig, RenderEngine};
use crate::error::RenderError;

/// A4 in points.
pub const PAGE_WIDTH: f32 = 595.0;
pub const PAGE_HEIGHT: f32 = 842.0;
/// Courier advance width as a fraction of the font size.
const COURIER_ADVANCE: f32 = 0.6;
const LINE_HEIGHT: f32 = 1.25;
const TAB_WIDTH: usize = 4;
/// Longest stderr excerpt carried in a [`RenderError`].
const STDERR_EXCERPT: usize = 400;

/// Turns markup into a document at `out`.
pub trait Renderer: Send + Sync {
    fn render_to_document(&self, markup: &str, out: &Path) -> Result<(), RenderError>;
}

/// Renders a thread segment: applies the template, then the renderer.
pub fn render_segment(
    renderer: &dyn Renderer,
    segment: &str,
    out: &Path,
) -> Result<(), RenderError> {
    renderer.render_to_document(&message_markup(segment), out)
}

/// Builds the renderer selected in `[render]`.
pub fn renderer_from_config(config: &RenderConfig) -> Arc<dyn Renderer> {
    match config.engine {
        RenderEngine::Builtin => Arc::new(BuiltinRenderer::new(config.font_size, config.margin)),
        RenderEngine::Command => Arc::new(CommandRenderer::new(
            config.command.clone(),
            (config.timeout_secs > 0).then(|| Duration::from_secs(config.timeout_secs)),
        )),
    }
}

// ============ Builtin engine ============

/// Native monospaced layout.
#[derive(Debug, Clone)]
pub struct BuiltinRenderer {
    font_size: f32,
    margin: f32,
}

impl Default for BuiltinRenderer {
    fn default() -> Self {
        Self::new(10.0, 50.0)
    }
}

impl BuiltinRenderer {
    pub fn new(font_size: f32, margin: f32) -> Self {
        Self { font_size, margin }
    }

    /// Characters per line.
    pub fn columns(&self) -> usize {
        let usable = PAGE_WIDTH - 2.0 * self.margin;
        ((usable / (self.font_size * COURIER_ADVANCE)).floor() as usize).max(1)
    }

    /// Lines per page.
    pub fn rows(&self) -> usize {
        let usable = PAGE_HEIGHT - 2.0 * self.margin;
        ((usable / (self.font_size * LINE_HEIGHT)).floor() as usize).max(1)
    }

    /// Lays `text` out into pages of visual lines.
    pub fn paginate(&self, text: &str) -> Vec<Vec<String>> {
        let lines = wrap_text(text, self.columns());
        let mut pages: Vec<Vec<String>> = lines
            .chunks(self.rows())
            .map(|chunk| chunk.to_vec())
            .collect();
        if pages.is_empty() {
            pages.push(Vec::new());
        }
        pages
    }

    fn build_document(&self, text: &str) -> Result<Document, RenderError> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
            "Encoding" => "WinAnsiEncoding",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });

        let leading = self.font_size * LINE_HEIGHT;
        let mut kids: Vec<Object> = Vec::new();
        for lines in self.paginate(text) {
            let mut operations = vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), self.font_size.into()]),
                Operation::new("TL", vec![leading.into()]),
                Operation::new(
                    "Td",
                    vec![
                        self.margin.into(),
                        (PAGE_HEIGHT - self.margin - self.font_size).into(),
                    ],
                ),
            ];
            for line in &lines {
                operations.push(Operation::new(
                    "Tj",
                    vec![Object::string_literal(encode_win_ansi(line))],
                ));
                operations.push(Operation::new("T*", vec![]));
            }
            operations.push(Operation::new("ET", vec![]));

            let content = Content { operations }
                .encode()
                .map_err(|e| RenderError::Pdf(e.to_string()))?;
            let content_id = doc.add_object(Stream::new(dictionary! {}, content));
            let page_id: ObjectId = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
            });
            kids.push(page_id.into());
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc.compress();
        Ok(doc)
    }
}

impl Renderer for BuiltinRenderer {
    fn render_to_document(&self, markup: &str, out: &Path) -> Result<(), RenderError> {
        let text = pre_text(markup)?;
        let mut doc = self.build_document(&text)?;
        let mut file = std::io::BufWriter::new(File::create(out)?);
        doc.save_to(&mut file)
            .map_err(|e| RenderError::Pdf(e.to_string()))?;
        file.flush()?;
        Ok(())
    }
}

/// Reads the text of the first `<pre>` element, unescaped, whitespace intact.
pub fn pre_text(markup: &str) -> Result<String, RenderError> {
    let mut reader = quick_xml::Reader::from_str(markup);
    let mut depth = 0usize;
    let mut found = false;
    let mut out = String::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if depth > 0 {
                    depth += 1;
                } else if e.local_name().as_ref() == b"pre" {
                    depth = 1;
                    found = true;
                }
            }
            Ok(Event::End(_)) if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            Ok(Event::Empty(e)) if depth == 0 && e.local_name().as_ref() == b"pre" => {
                found = true;
                break;
            }
            Ok(Event::Text(t)) if depth > 0 => {
                let text = t.unescape().map_err(|e| RenderError::Markup(e.to_string()))?;
                out.push_str(&text);
            }
            Ok(Event::CData(t)) if depth > 0 => {
                out.push_str(&String::from_utf8_lossy(&t.into_inner()));
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(RenderError::Markup(e.to_string())),
            _ => {}
        }
    }
    if !found {
        return Err(RenderError::Markup("no <pre> element".to_string()));
    }
    Ok(out)
}

/// Splits text into visual lines of at most `columns` characters.
///
/// Blank lines are kept, tabs expand to the next multiple of four, and long
/// lines break at the last space that fits, or mid-word when there is none.
pub fn wrap_text(text: &str, columns: usize) -> Vec<String> {
    let columns = columns.max(1);
    let mut out = Vec::new();
    for raw in text.split('\n') {
        let line = expand_tabs(raw.strip_suffix('\r').unwrap_or(raw));
        let chars: Vec<char> = line.chars().collect();
        if chars.is_empty() {
            out.push(String::new());
            continue;
        }
        let mut start = 0;
        while start < chars.len() {
            let end = (start + columns).min(chars.len());
            if end == chars.len() {
                out.push(chars[start..end].iter().collect());
                break;
            }
            let cut = chars[start..end]
                .iter()
                .rposition(|c| *c == ' ')
                .filter(|&i| i > 0)
                .map(|i| start + i + 1)
                .unwrap_or(end);
            out.push(chars[start..cut].iter().collect());
            start = cut;
        }
    }
    out
}

fn expand_tabs(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut col = 0;
    for c in line.chars() {
        if c == '\t' {
            let pad = TAB_WIDTH - col % TAB_WIDTH;
            out.extend(std::iter::repeat(' ').take(pad));
            col += pad;
        } else {
            out.push(c);
            col += 1;
        }
    }
    out
}

/// Encodes text for a WinAnsi (cp1252) Type 1 font. Unmappable characters
/// become `?`, control characters become spaces.
pub fn encode_win_ansi(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| match c {
            '\u{20}'..='\u{7e}' => c as u8,
            '\u{a0}'..='\u{ff}' => c as u8,
            '€' => 0x80,
            '‚' => 0x82,
            'ƒ' => 0x83,
            '„' => 0x84,
            '…' => 0x85,
            '†' => 0x86,
            '‡' => 0x87,
            'ˆ' => 0x88,
            '‰' => 0x89,
            'Š' => 0x8a,
            '‹' => 0x8b,
            'Œ' => 0x8c,
            'Ž' => 0x8e,
            '\u{2018}' => 0x91,
            '\u{2019}' => 0x92,
            '\u{201c}' => 0x93,
            '\u{201d}' => 0x94,
            '•' => 0x95,
            '–' => 0x96,
            '—' => 0x97,
            '˜' => 0x98,
            '™' => 0x99,
            'š' => 0x9a,
            '›' => 0x9b,
            'œ' => 0x9c,
            'ž' => 0x9e,
            'Ÿ' => 0x9f,
            c if c.is_control() => b' ',
            _ => b'?',
        })
        .collect()
}

// ============ Command engine ============

/// Runs an external HTML-to-PDF command.
///
/// The markup is written next to the output as `<out>.html`; `{input}` and
/// `{output}` in the argument vector are replaced with the two paths.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    argv: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandRenderer {
    pub fn new(argv: Vec<String>, timeout: Option<Duration>) -> Self {
        Self { argv, timeout }
    }

    fn run(&self, input: &Path, out: &Path, stderr_path: &Path) -> Result<(), RenderError> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| RenderError::Spawn("empty render command".to_string()))?;
        let input_s = input.to_string_lossy();
        let out_s = out.to_string_lossy();
        let args: Vec<String> = args
            .iter()
            .map(|a| a.replace("{input}", &input_s).replace("{output}", &out_s))
            .collect();

        let stderr_file = File::create(stderr_path)?;
        let mut command = tokio::process::Command::new(program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_file))
            .kill_on_drop(true);

        let status = block_on(self.wait_for(command, program))??;

        if !status.success() {
            let stderr = std::fs::read_to_string(stderr_path).unwrap_or_default();
            let workspace = out.parent().map(|p| p.to_string_lossy().into_owned());
            let mut stderr = match workspace {
                Some(dir) if !dir.is_empty() => stderr.replace(&dir, "<workspace>"),
                _ => stderr,
            };
            if let Some((idx, _)) = stderr.char_indices().nth(STDERR_EXCERPT) {
                stderr.truncate(idx);
            }
            return Err(RenderError::Failed {
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        if !out.is_file() {
            return Err(RenderError::NoOutput);
        }
        Ok(())
    }

    async fn wait_for(
        &self,
        mut command: tokio::process::Command,
        program: &str,
    ) -> Result<ExitStatus, RenderError> {
        let mut child = command
            .spawn()
            .map_err(|e| RenderError::Spawn(format!("{}: {}", program, e.kind())))?;
        let Some(limit) = self.timeout else {
            return Ok(child.wait().await?);
        };
        match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => Ok(status?),
            Err(_) => {
                let _ = child.kill().await;
                Err(RenderError::Timeout(limit.as_secs()))
            }
        }
    }
}

/// Drives `fut` to completion from synchronous code.
///
/// Renderers are called on the blocking pool, where the ambient runtime is
/// reachable through its handle. Outside a runtime a current-thread one is
/// built for the call.
fn block_on<F: Future>(fut: F) -> std::io::Result<F::Output> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Ok(handle.block_on(fut)),
        Err(_) => Ok(tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(fut)),
    }
}

impl Renderer for CommandRenderer {
    fn render_to_document(&self, markup: &str, out: &Path) -> Result<(), RenderError> {
        let input = sibling(out, "html");
        let stderr_path = sibling(out, "stderr.log");
        std::fs::write(&input, markup)?;
        let result = self.run(&input, out, &stderr_path);
        let _ = std::fs::remove_file(&input);
        let _ = std::fs::remove_file(&stderr_path);
        result
    }
}

fn sibling(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(ext);
    path.with_file_name(name)
}
