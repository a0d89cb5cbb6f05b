use async_trait::async_trait;
use regex::Regex;
use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

use crate::clients::CloudOcrClient;
use crate::models::*;

pub const LOCAL_TEXT: &str = "local_text";
pub const CLOUD_OCR: &str = "cloud_ocr";
pub const LOCAL_OCR: &str = "local_ocr";

/// Confidence reported for tesseract output, which carries no score of its own.
const LOCAL_OCR_CONFIDENCE: f32 = 0.7;

/// Bytes of one File handed to the strategy chain.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionInput<'a> {
    pub file_id: &'a str,
    pub mime_type: Option<&'a mime::Mime>,
    pub bytes: &'a [u8],
}

/// Uniform strategy result.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyResult {
    pub text: String,
    pub method: String,
    pub confidence: f32,
}

#[async_trait]
pub trait ExtractionStrategy: Send + Sync {
    /// Identifier recorded on the File when this strategy wins.
    fn method(&self) -> &str;

    fn accepts(&self, mime_type: Option<&mime::Mime>) -> bool;

    async fn extract(&self, input: &ExtractionInput<'_>) -> Result<StrategyResult>;
}

fn is_pdf(m: &mime::Mime) -> bool {
    m.type_() == mime::APPLICATION && m.subtype() == mime::PDF
}

fn is_html(m: &mime::Mime) -> bool {
    m.subtype() == mime::HTML || m.essence_str() == "application/xhtml+xml"
}

/// Share of characters that are letters, digits or whitespace.
pub fn text_confidence(text: &str) -> f32 {
    let total = text.chars().count();
    if total == 0 {
        return 0.0;
    }
    let good = text
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || c.is_ascii_punctuation())
        .count();
    good as f32 / total as f32
}

fn strip_html(html: &str) -> String {
    static PATTERNS: OnceLock<Option<(Regex, Regex)>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        let scripts = Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>").ok()?;
        let tags = Regex::new(r"(?s)<[^>]+>").ok()?;
        Some((scripts, tags))
    });
    let stripped = match patterns {
        Some((scripts, tags)) => tags.replace_all(&scripts.replace_all(html, " "), " ").into_owned(),
        None => html.to_string(),
    };
    let decoded = stripped
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Text already present in the file: plain text, HTML, PDF text layer.
#[derive(Debug, Default, Clone)]
pub struct LocalTextStrategy;

#[async_trait]
impl ExtractionStrategy for LocalTextStrategy {
    fn method(&self) -> &str {
        LOCAL_TEXT
    }

    fn accepts(&self, mime_type: Option<&mime::Mime>) -> bool {
        match mime_type {
            None => true,
            Some(m) => m.type_() == mime::TEXT || is_html(m) || is_pdf(m),
        }
    }

    async fn extract(&self, input: &ExtractionInput<'_>) -> Result<StrategyResult> {
        let text = match input.mime_type {
            Some(m) if is_pdf(m) => pdf_text(input.bytes).await?,
            Some(m) if is_html(m) => strip_html(&String::from_utf8_lossy(input.bytes)),
            _ => {
                if input.bytes.starts_with(b"%PDF") {
                    pdf_text(input.bytes).await?
                } else {
                    String::from_utf8_lossy(input.bytes).trim().to_string()
                }
            }
        };
        let text = text.trim().to_string();
        Ok(StrategyResult { confidence: text_confidence(&text), text, method: LOCAL_TEXT.to_string() })
    }
}

#[cfg(feature = "pdf")]
async fn pdf_text(bytes: &[u8]) -> Result<String> {
    let data = bytes.to_vec();
    tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&data))
        .await
        .map_err(|e| IngestionError::Extraction(format!("PDF worker failed: {}", e)))?
        .map_err(|e| IngestionError::Extraction(format!("PDF text extraction failed: {}", e)))
}

#[cfg(not(feature = "pdf"))]
async fn pdf_text(_bytes: &[u8]) -> Result<String> {
    Err(IngestionError::Extraction("PDF support not compiled in (feature `pdf`)".to_string()))
}

/// External OCR capability.
pub struct CloudOcrStrategy {
    client: CloudOcrClient,
}

impl CloudOcrStrategy {
    pub fn new(client: CloudOcrClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ExtractionStrategy for CloudOcrStrategy {
    fn method(&self) -> &str {
        CLOUD_OCR
    }

    fn accepts(&self, mime_type: Option<&mime::Mime>) -> bool {
        match mime_type {
            None => true,
            Some(m) => m.type_() == mime::IMAGE || is_pdf(m),
        }
    }

    async fn extract(&self, input: &ExtractionInput<'_>) -> Result<StrategyResult> {
        let response = self
            .client
            .extract(input.bytes, input.mime_type.map(|m| m.essence_str()))
            .await?;
        let text = response.text.trim().to_string();
        let confidence = response.confidence.unwrap_or_else(|| text_confidence(&text));
        Ok(StrategyResult { text, method: CLOUD_OCR.to_string(), confidence })
    }
}

/// Local `tesseract` binary; the input is staged in a temporary file. PDFs have no
/// image tesseract can read, so their pages are first rendered with `pdftoppm`.
pub struct LocalOcrStrategy {
    binary: String,
    rasterizer: String,
    language: Option<String>,
}

impl LocalOcrStrategy {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into(), rasterizer: "pdftoppm".to_string(), language: None }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_rasterizer(mut self, binary: impl Into<String>) -> Self {
        self.rasterizer = binary.into();
        self
    }

    async fn ocr_image(&self, path: &Path) -> Result<String> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.arg(path.as_os_str()).arg("stdout");
        if let Some(lang) = &self.language {
            cmd.arg("-l").arg(lang);
        }
        let stdout = run(&self.binary, &mut cmd).await?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }

    /// Render every page at 300 dpi and OCR the pages in order.
    async fn ocr_pdf(&self, bytes: &[u8]) -> Result<String> {
        let dir = tempfile::Builder::new().prefix("oparl-ocr-").tempdir()?;
        let pdf = dir.path().join("input.pdf");
        tokio::fs::write(&pdf, bytes).await?;

        let mut cmd = tokio::process::Command::new(&self.rasterizer);
        cmd.args(["-r", "300", "-png"]).arg(&pdf).arg(dir.path().join("page"));
        run(&self.rasterizer, &mut cmd).await?;

        let mut pages = Vec::new();
        let mut entries = tokio::fs::read_dir(dir.path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_page = path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.starts_with("page"))
                && path.extension().is_some_and(|e| e == "png");
            if is_page {
                pages.push(path);
            }
        }
        if pages.is_empty() {
            return Err(IngestionError::Extraction(format!("{} rendered no pages", self.rasterizer)));
        }
        // Page numbers are zero padded to a common width
        pages.sort();

        let mut texts = Vec::with_capacity(pages.len());
        for page in &pages {
            let text = self.ocr_image(page).await?;
            if !text.is_empty() {
                texts.push(text);
            }
        }
        Ok(texts.join("\n\n"))
    }
}

/// Run an external tool to completion and hand back its stdout.
async fn run(binary: &str, cmd: &mut tokio::process::Command) -> Result<Vec<u8>> {
    let output = cmd
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| IngestionError::Extraction(format!("Failed to run {}: {}", binary, e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(IngestionError::Extraction(format!(
            "{} exited with {}: {}",
            binary,
            output.status,
            stderr.trim()
        )));
    }
    Ok(output.stdout)
}

#[async_trait]
impl ExtractionStrategy for LocalOcrStrategy {
    fn method(&self) -> &str {
        LOCAL_OCR
    }

    fn accepts(&self, mime_type: Option<&mime::Mime>) -> bool {
        match mime_type {
            None => true,
            Some(m) => m.type_() == mime::IMAGE || is_pdf(m),
        }
    }

    async fn extract(&self, input: &ExtractionInput<'_>) -> Result<StrategyResult> {
        let pdf = input.mime_type.map_or(input.bytes.starts_with(b"%PDF"), is_pdf);
        let text = if pdf {
            self.ocr_pdf(input.bytes).await?
        } else {
            let suffix = match input.mime_type.map(|m| m.subtype().as_str()) {
                Some("png") => ".png",
                Some("jpeg") => ".jpg",
                Some("tiff") => ".tif",
                _ => ".img",
            };
            let mut staged = tempfile::Builder::new().prefix("oparl-ocr-").suffix(suffix).tempfile()?;
            staged.write_all(input.bytes)?;
            staged.flush()?;
            let path = staged.into_temp_path();
            self.ocr_image(&path).await?
        };
        let confidence = if text.is_empty() { 0.0 } else { LOCAL_OCR_CONFIDENCE };
        tracing::debug!(file_id = %input.file_id, pdf = pdf, chars = text.len(), "Local OCR finished");
        Ok(StrategyResult { text, method: LOCAL_OCR.to_string(), confidence })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_is_reduced_to_text() {
        let html = "<html><head><style>p {color: red}</style></head><body><p>Beschluss&nbsp;Nr. 5</p>\n<script>var x;</script><b>angenommen</b></body></html>";
        assert_eq!(strip_html(html), "Beschluss Nr. 5 angenommen");
    }

    #[test]
    fn confidence_penalises_binary_noise() {
        assert_eq!(text_confidence(""), 0.0);
        assert!(text_confidence("Sitzung des Rates am 5. Mai") > 0.95);
        assert!(text_confidence("\u{fffd}\u{fffd}\u{fffd}a") < 0.5);
    }

    #[tokio::test]
    async fn plain_text_is_read_directly() {
        let mime: mime::Mime = "text/plain".parse().unwrap();
        let input = ExtractionInput { file_id: "f1", mime_type: Some(&mime), bytes: b"  Tagesordnung  " };
        let result = LocalTextStrategy.extract(&input).await.unwrap();
        assert_eq!(result.text, "Tagesordnung");
        assert_eq!(result.method, LOCAL_TEXT);
    }

    #[test]
    fn strategies_declare_what_they_accept() {
        let png: mime::Mime = "image/png".parse().unwrap();
        let pdf: mime::Mime = "application/pdf".parse().unwrap();
        assert!(!LocalTextStrategy.accepts(Some(&png)));
        assert!(LocalTextStrategy.accepts(Some(&pdf)));
        assert!(LocalOcrStrategy::new("tesseract").accepts(Some(&png)));
        assert!(LocalOcrStrategy::new("tesseract").accepts(Some(&pdf)));
    }

    #[tokio::test]
    async fn missing_tesseract_binary_is_an_error() {
        let png: mime::Mime = "image/png".parse().unwrap();
        let strategy = LocalOcrStrategy::new("/nonexistent/tesseract-binary");
        let input = ExtractionInput { file_id: "f1", mime_type: Some(&png), bytes: b"\x89PNG" };
        assert!(matches!(strategy.extract(&input).await, Err(IngestionError::Extraction(_))));
    }

    #[tokio::test]
    async fn missing_rasterizer_is_an_error() {
        let pdf: mime::Mime = "application/pdf".parse().unwrap();
        let strategy = LocalOcrStrategy::new("tesseract").with_rasterizer("/nonexistent/pdftoppm-binary");
        let input = ExtractionInput { file_id: "f1", mime_type: Some(&pdf), bytes: b"%PDF-1.4" };
        match strategy.extract(&input).await {
            Err(IngestionError::Extraction(msg)) => assert!(msg.contains("pdftoppm-binary"), "{}", msg),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
