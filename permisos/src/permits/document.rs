//! Permit document rendering.
//!
//! The permit text comes from a minijinja template and is laid out on a single A4 page using the
//! standard Helvetica fonts, so no font files need to ship with the service. Long lines wrap at
//! word boundaries; text that still does not fit on the page is an error rather than being cut.

use chrono::{DateTime, Utc};
use minijinja::Environment;
use printpdf::{BuiltinFont, Mm, PdfDocument, Pt};
use serde::Serialize;

use crate::{config::PermitConfig, db::models::applications::ApplicationDBResponse, errors::Error};

/// Built-in permit text. Lines starting with `# ` are set as headings.
pub const DEFAULT_TEMPLATE: &str = r#"# PERMISO DIGITAL DE CIRCULACIÓN
{{ issuing_authority }}

Folio: {{ folio }}
Vigencia: del {{ valid_from }} al {{ valid_until }}
Fecha de expedición: {{ issued_at }}

# DATOS DEL SOLICITANTE
Nombre: {{ applicant_name }}
CURP/RFC: {{ curp_rfc }}
Domicilio: {{ address }}

# DATOS DEL VEHÍCULO
Marca: {{ make }}
Modelo: {{ model }}
Año: {{ model_year }}
Color: {{ color }}
Número de serie (VIN): {{ vin }}
Número de motor: {{ engine_number }}

Derechos pagados: ${{ amount }} {{ currency }}

Este permiso debe portarse en el vehículo durante su vigencia.
"#;

// A4 in points
const PAGE_WIDTH: f32 = 595.0;
const PAGE_HEIGHT: f32 = 842.0;
const MARGIN: f32 = 56.0;
const BODY_SIZE: f32 = 11.0;
const HEADING_SIZE: f32 = 15.0;
const LINE_GAP: f32 = 5.0;

/// Values available to the permit template.
#[derive(Debug, Clone, Serialize)]
pub struct PermitDocument {
    pub folio: String,
    pub issuing_authority: String,
    pub applicant_name: String,
    pub curp_rfc: String,
    pub address: String,
    pub make: String,
    pub model: String,
    pub color: String,
    pub vin: String,
    pub engine_number: String,
    pub model_year: i32,
    pub amount: String,
    pub currency: String,
    pub valid_from: String,
    pub valid_until: String,
    pub issued_at: String,
}

impl PermitDocument {
    pub fn new(
        application: &ApplicationDBResponse,
        folio: &str,
        valid_from: DateTime<Utc>,
        valid_until: DateTime<Utc>,
        issuing_authority: &str,
    ) -> Self {
        Self {
            folio: folio.to_string(),
            issuing_authority: issuing_authority.to_string(),
            applicant_name: application.applicant_name.clone(),
            curp_rfc: application.curp_rfc.clone(),
            address: application.address.clone(),
            make: application.make.clone(),
            model: application.model.clone(),
            color: application.color.clone(),
            vin: application.vin.clone(),
            engine_number: application.engine_number.clone(),
            model_year: application.model_year,
            amount: format!("{:.2}", application.amount),
            currency: application.currency.clone(),
            valid_from: valid_from.format("%d/%m/%Y").to_string(),
            valid_until: valid_until.format("%d/%m/%Y").to_string(),
            issued_at: valid_from.format("%d/%m/%Y %H:%M UTC").to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PermitRenderer {
    template: String,
}

impl Default for PermitRenderer {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

impl PermitRenderer {
    pub fn new(template: impl Into<String>) -> Self {
        Self { template: template.into() }
    }

    /// Use the configured template file, or the built-in one when none is set.
    pub async fn from_config(config: &PermitConfig) -> Result<Self, Error> {
        match &config.template {
            Some(path) => {
                let template = tokio::fs::read_to_string(path).await.map_err(|e| Error::Internal {
                    operation: format!("read permit template {}: {e}", path.display()),
                })?;
                Ok(Self::new(template))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn render_text(&self, document: &PermitDocument) -> Result<String, Error> {
        Environment::new()
            .render_str(&self.template, document)
            .map_err(|e| Error::Internal {
                operation: format!("render permit template: {e}"),
            })
    }

    pub fn render_pdf(&self, document: &PermitDocument) -> Result<Vec<u8>, Error> {
        text_to_pdf(&self.render_text(document)?, &document.folio)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Style {
    Body,
    Heading,
}

impl Style {
    fn size(self) -> f32 {
        match self {
            Style::Body => BODY_SIZE,
            Style::Heading => HEADING_SIZE,
        }
    }
}

/// One line of text at its final position; `baseline` is in points from the bottom of the page.
#[derive(Debug, Clone, PartialEq)]
struct PlacedLine {
    style: Style,
    baseline: f32,
    text: String,
}

/// Approximate Helvetica advance width in thousandths of an em.
///
/// Rounded up per glyph class, so measured lines are never narrower than the real ones.
fn glyph_width(c: char, style: Style) -> f32 {
    let width = match c {
        ' ' | 'i' | 'j' | 'l' | '.' | ',' | ':' | ';' | '\'' | '!' | '|' => 280.0,
        'f' | 't' | 'r' | 'I' | '(' | ')' | '-' | '/' => 340.0,
        'm' | 'M' | 'W' => 840.0,
        'w' => 730.0,
        c if c.is_uppercase() => 730.0,
        _ => 560.0,
    };
    match style {
        Style::Body => width,
        Style::Heading => width + 40.0,
    }
}

fn text_width(text: &str, style: Style) -> f32 {
    text.chars().map(|c| glyph_width(c, style)).sum::<f32>() * style.size() / 1000.0
}

/// Greedy word wrap to `max_width` points. Words wider than a whole line are split by character.
fn wrap(line: &str, style: Style, max_width: f32) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in line.split_whitespace() {
        let candidate = if current.is_empty() {
            word.to_string()
        } else {
            format!("{current} {word}")
        };
        if text_width(&candidate, style) <= max_width {
            current = candidate;
            continue;
        }

        if !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        for c in word.chars() {
            current.push(c);
            if text_width(&current, style) > max_width {
                current.pop();
                lines.push(std::mem::replace(&mut current, c.to_string()));
            }
        }
    }

    if !current.is_empty() || lines.is_empty() {
        lines.push(current);
    }
    lines
}

/// Position every line of `text` on one page. Lines starting with `# ` are headings.
fn layout(text: &str) -> Result<Vec<PlacedLine>, Error> {
    let max_width = PAGE_WIDTH - 2.0 * MARGIN;
    let mut placed = Vec::new();
    let mut y = PAGE_HEIGHT - MARGIN;

    for line in text.lines() {
        let (style, line) = match line.strip_prefix("# ") {
            Some(heading) => (Style::Heading, heading),
            None => (Style::Body, line),
        };

        for wrapped in wrap(line, style, max_width) {
            y -= style.size();
            if y < MARGIN {
                return Err(Error::Internal {
                    operation: "lay out permit: text does not fit on one page".to_string(),
                });
            }
            if !wrapped.is_empty() {
                placed.push(PlacedLine {
                    style,
                    baseline: y,
                    text: wrapped,
                });
            }
            y -= LINE_GAP;
        }
    }

    Ok(placed)
}

/// Lay out `text` on one A4 page and serialize it.
pub fn text_to_pdf(text: &str, title: &str) -> Result<Vec<u8>, Error> {
    let placed = layout(text)?;
    let pdf_error = |e: printpdf::Error| Error::Internal {
        operation: format!("write permit PDF: {e}"),
    };

    let (doc, page, layer) = PdfDocument::new(title, Mm::from(Pt(PAGE_WIDTH)), Mm::from(Pt(PAGE_HEIGHT)), "permit");
    let body = doc.add_builtin_font(BuiltinFont::Helvetica).map_err(pdf_error)?;
    let heading = doc.add_builtin_font(BuiltinFont::HelveticaBold).map_err(pdf_error)?;
    let layer = doc.get_page(page).get_layer(layer);

    for line in &placed {
        let font = match line.style {
            Style::Body => &body,
            Style::Heading => &heading,
        };
        layer.use_text(line.text.as_str(), line.style.size(), Mm::from(Pt(MARGIN)), Mm::from(Pt(line.baseline)), font);
    }

    doc.save_to_bytes().map_err(pdf_error)
}
