//! Single-page PDF rendering of a sanitization certificate.
//! Output is uncompressed and uses only the standard Type1 fonts, so no font data is embedded.

use chrono::{DateTime, Utc};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use uuid::Uuid;

use super::model::SanitizationRecord;

pub const ORGANIZATION: &str = "Media Sanitization Department";

const PAGE_WIDTH: i64 = 595;
const PAGE_HEIGHT: i64 = 842;
const MARGIN: i64 = 72;
const ROW_HEIGHT: i64 = 20;
const LABEL_WIDTH: i64 = 180;
const VALUE_WIDTH: i64 = 252;
const WRAP_COLUMNS: usize = 92;

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("document encoding failed: {0}")]
    Encode(String),
}

/// Render with the current time as the generation date.
pub fn render(record: &SanitizationRecord, certificate_id: Uuid, identity_email: &str) -> Result<Vec<u8>, RenderError> {
    render_at(record, certificate_id, identity_email, Utc::now())
}

/// Byte-identical for identical inputs.
pub fn render_at(
    record: &SanitizationRecord,
    certificate_id: Uuid,
    identity_email: &str,
    generated_at: DateTime<Utc>,
) -> Result<Vec<u8>, RenderError> {
    if let Some(field) = record.missing_fields().first().copied() {
        return Err(RenderError::MissingField(field));
    }

    let mut page = Canvas::new();
    page.centered("F2", 18, "MEDIA SANITIZATION CERTIFICATE");
    page.gap(30);

    let generated = generated_at.format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let id = certificate_id.to_string();
    for (label, value) in [
        ("Certificate ID:", id.as_str()),
        ("Date Generated:", generated.as_str()),
        ("Authorized By:", identity_email),
        ("Organization:", ORGANIZATION),
    ] {
        page.pair(label, value, 144);
    }
    page.gap(20);

    page.heading("DEVICE INFORMATION");
    page.table(&[
        ("Manufacturer:", record.manufacturer.as_str()),
        ("Model:", record.model.as_str()),
        ("Serial Number:", record.serial_number.as_str()),
        ("Property Number:", or_na(&record.property_number)),
        ("Media Type:", record.media_type.as_str()),
        ("Media Source:", record.media_source.as_str()),
    ]);
    page.gap(20);

    page.heading("SANITIZATION INFORMATION");
    page.table(&[
        ("Pre-Sanitization Confidentiality:", or_na(&record.pre_sanitization_confidentiality)),
        ("Sanitization Method:", record.sanitization_method.as_str()),
        ("Sanitization Technique:", record.sanitization_technique.as_str()),
        ("Tool Used:", record.tool_used.as_str()),
        ("Verification Method:", record.verification_method.as_str()),
        ("Post-Sanitization Confidentiality:", or_na(&record.post_sanitization_confidentiality)),
        ("Post-Sanitization Destination:", or_na(&record.post_sanitization_destination)),
    ]);
    page.gap(40);

    page.heading("CERTIFICATION");
    let statement = format!(
        "This certificate confirms that the above-mentioned media has been sanitized according to the \
         specified method and technique. The sanitization process has been verified using the indicated \
         verification method. This certificate serves as official documentation of the media sanitization \
         process and was authorized by {}.",
        identity_email
    );
    for line in wrap(&statement, WRAP_COLUMNS) {
        page.text("F1", 10, MARGIN, &line);
        page.gap(14);
    }

    page.into_pdf()
}

fn or_na(v: &Option<String>) -> &str {
    v.as_deref().filter(|s| !s.trim().is_empty()).unwrap_or("N/A")
}

/// Bytes for a WinAnsi-encoded standard font. Printable Latin-1 maps straight through;
/// anything else becomes `?`.
fn latin1(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| match c {
            ' ' => b' ',
            c if c.is_ascii_graphic() => c as u8,
            '\u{a0}'..='\u{ff}' => c as u32 as u8,
            _ => b'?',
        })
        .collect()
}

fn wrap(text: &str, columns: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if !current.is_empty() && current.len() + 1 + word.len() > columns {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Top-down cursor over one page's content stream.
struct Canvas {
    ops: Vec<Operation>,
    y: i64,
}

impl Canvas {
    fn new() -> Self { Self { ops: Vec::new(), y: PAGE_HEIGHT - MARGIN } }

    fn gap(&mut self, dy: i64) { self.y -= dy; }

    fn text(&mut self, font: &str, size: i64, x: i64, s: &str) {
        self.ops.push(Operation::new("BT", vec![]));
        self.ops.push(Operation::new("Tf", vec![Object::Name(font.as_bytes().to_vec()), Object::Integer(size)]));
        self.ops.push(Operation::new("Td", vec![Object::Integer(x), Object::Integer(self.y)]));
        self.ops.push(Operation::new("Tj", vec![Object::string_literal(latin1(s))]));
        self.ops.push(Operation::new("ET", vec![]));
    }

    fn centered(&mut self, font: &str, size: i64, s: &str) {
        // Helvetica averages a little over half the point size per glyph
        let width = (s.chars().count() as i64) * size * 6 / 10;
        self.text(font, size, ((PAGE_WIDTH - width) / 2).max(MARGIN), s);
    }

    fn heading(&mut self, s: &str) {
        self.text("F2", 14, MARGIN, s);
        self.gap(24);
    }

    fn pair(&mut self, label: &str, value: &str, label_width: i64) {
        self.text("F2", 10, MARGIN, label);
        self.text("F1", 10, MARGIN + label_width, value);
        self.gap(16);
    }

    fn table(&mut self, rows: &[(&str, &str)]) {
        self.ops.push(Operation::new("q", vec![]));
        self.ops.push(Operation::new("RG", vec![Object::Real(0.8), Object::Real(0.8), Object::Real(0.8)]));
        self.ops.push(Operation::new("w", vec![Object::Integer(1)]));
        for i in 0..rows.len() as i64 {
            let bottom = self.y - 6 - i * ROW_HEIGHT;
            for (x, w) in [(MARGIN, LABEL_WIDTH), (MARGIN + LABEL_WIDTH, VALUE_WIDTH)] {
                self.ops.push(Operation::new(
                    "re",
                    vec![Object::Integer(x), Object::Integer(bottom), Object::Integer(w), Object::Integer(ROW_HEIGHT)],
                ));
            }
        }
        self.ops.push(Operation::new("S", vec![]));
        self.ops.push(Operation::new("Q", vec![]));
        for (label, value) in rows {
            self.text("F2", 10, MARGIN + 4, label);
            self.text("F1", 10, MARGIN + LABEL_WIDTH + 4, value);
            self.gap(ROW_HEIGHT);
        }
    }

    fn into_pdf(self) -> Result<Vec<u8>, RenderError> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let regular = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
            "Encoding" => "WinAnsiEncoding",
        });
        let bold = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica-Bold",
            "Encoding" => "WinAnsiEncoding",
        });
        let resources = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => regular, "F2" => bold },
        });
        let content = Content { operations: self.ops };
        let encoded = content.encode().map_err(|e| RenderError::Encode(e.to_string()))?;
        let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![Object::Reference(page_id)],
                "Count" => 1,
                "Resources" => resources,
                "MediaBox" => vec![Object::Integer(0), Object::Integer(0), Object::Integer(PAGE_WIDTH), Object::Integer(PAGE_HEIGHT)],
            }),
        );
        let catalog = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog);

        let mut out = Vec::new();
        doc.save_to(&mut out).map_err(|e| RenderError::Encode(e.to_string()))?;
        Ok(out)
    }
}
