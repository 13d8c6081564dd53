//! Parse strategies: pure functions from a response body to records.
//!
//! Each strategy returns `None` when it finds nothing usable, which the
//! resolver treats as a parse mismatch and moves on. Records that fail
//! [`RegulationRecord::is_valid`] are dropped and duplicates (same locator id)
//! keep their first occurrence.

use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use std::collections::HashSet;

use crate::models::RegulationRecord;

const ECFR_HOST: &str = "https://www.ecfr.gov";
const TITLE: &str = "Title 21";
const TITLE_PATH: &str = "https://www.ecfr.gov/current/title-21";

/// Selectors tried in order to locate the regulation table.
const TABLE_SELECTORS: [&str; 5] = [
    "table",
    ".regulation-table",
    "#regulations-table",
    "[class*=\"regulation\"]",
    "[id*=\"regulation\"]",
];

const MAX_PART_LINKS: usize = 100;
const MAX_DESCRIPTION_CHARS: usize = 200;

/// Inputs shared by every strategy besides the body itself.
#[derive(Debug, Clone, Copy)]
pub struct ParseContext<'a> {
    /// URL the body was fetched from.
    pub url: &'a str,
    /// Timestamp stamped on produced records.
    pub fetched_at: i64,
}

pub type Parser = fn(&[u8], &ParseContext<'_>) -> Option<Vec<RegulationRecord>>;

/// Structured-table extraction: chapter, subchapter and part rows of the
/// title's table of contents.
pub fn parse_table(body: &[u8], ctx: &ParseContext<'_>) -> Option<Vec<RegulationRecord>> {
    let html = String::from_utf8_lossy(body);
    let document = Html::parse_document(&html);

    let table = find_table(&document)?;
    let row_sel = selector("tr")?;
    let cell_sel = selector("td, th")?;
    let link_sel = selector("a")?;

    let mut records = Vec::new();
    let mut chapter = String::new();
    let mut subchapter = String::new();

    for row in table.select(&row_sel) {
        let cells: Vec<ElementRef> = row.select(&cell_sel).collect();
        if cells.len() < 2 {
            continue;
        }
        let Some(link) = cells.iter().flat_map(|c| c.select(&link_sel)).next() else {
            continue;
        };

        let text = element_text(&link);
        let lower = text.to_lowercase();
        let url = normalize_url(link.value().attr("href").unwrap_or(""));
        let description = element_text(&cells[1]);
        let section_range = cells.get(2).map(element_text).unwrap_or_default();

        let record = if lower.contains("subchapter") {
            subchapter = text.clone();
            RegulationRecord::new(
                TITLE, &chapter, &text, "", &section_range, &description, &url, ctx.fetched_at,
            )
        } else if lower.contains("chapter") {
            chapter = text.clone();
            subchapter.clear();
            RegulationRecord::new(
                TITLE, &text, "", "", &section_range, &description, &url, ctx.fetched_at,
            )
        } else if lower.starts_with("part ") {
            RegulationRecord::new(
                TITLE,
                &chapter,
                &subchapter,
                &text,
                &section_range,
                &description,
                &url,
                ctx.fetched_at,
            )
        } else {
            continue;
        };
        records.push(record);
    }

    finish(records)
}

fn find_table<'a>(document: &'a Html) -> Option<ElementRef<'a>> {
    for css in TABLE_SELECTORS {
        if let Some(sel) = selector(css) {
            if let Some(found) = document.select(&sel).next() {
                return Some(found);
            }
        }
    }
    let tables = selector("table")?;
    document.select(&tables).find(|t| {
        let text = element_text(t).to_lowercase();
        ["part", "chapter", "section", "regulation"]
            .iter()
            .any(|k| text.contains(k))
    })
}

/// Link-pattern extraction: every `/part-` link whose text names a single
/// part. Chapter and subchapter come from the link's URL path, falling back
/// to the page URL.
pub fn parse_links(body: &[u8], ctx: &ParseContext<'_>) -> Option<Vec<RegulationRecord>> {
    let html = String::from_utf8_lossy(body);
    let document = Html::parse_document(&html);
    let link_sel = selector("a[href]")?;
    let cell_sel = selector("td, th")?;

    let (page_chapter, page_subchapter) = locators_from_path(ctx.url);
    let mut seen_parts = HashSet::new();
    let mut records = Vec::new();

    let part_links = document
        .select(&link_sel)
        .filter(|a| a.value().attr("href").is_some_and(|h| h.contains("/part-")))
        .take(MAX_PART_LINKS);

    for link in part_links {
        let part = element_text(&link);
        if !part.starts_with("Part ") || part.starts_with("Parts ") {
            continue;
        }
        if !seen_parts.insert(part.clone()) {
            continue;
        }

        let href = link.value().attr("href").unwrap_or("");
        let url = normalize_url(href);
        let (chapter, subchapter) = match locators_from_path(&url) {
            (c, s) if !c.is_empty() => (c, s),
            _ => (page_chapter.clone(), page_subchapter.clone()),
        };

        let row = link
            .ancestors()
            .filter_map(ElementRef::wrap)
            .find(|e| e.value().name() == "tr");
        let (description, section_range) = match row {
            Some(row) => {
                let cells: Vec<ElementRef> = row.select(&cell_sel).collect();
                let description = match cells.get(1) {
                    Some(cell) => element_text(cell),
                    None => element_text(&row),
                };
                let section_range = cells.get(2).map(element_text).unwrap_or_default();
                (description, section_range)
            }
            None => {
                let parent = link
                    .ancestors()
                    .filter_map(ElementRef::wrap)
                    .find(|e| matches!(e.value().name(), "td" | "li" | "p" | "div"));
                let description = parent.map(|p| element_text(&p)).unwrap_or_else(|| part.clone());
                (description, String::new())
            }
        };
        let description: String = description.chars().take(MAX_DESCRIPTION_CHARS).collect();

        records.push(RegulationRecord::new(
            TITLE,
            &chapter,
            &subchapter,
            &part,
            &section_range,
            &description,
            &url,
            ctx.fetched_at,
        ));
    }

    finish(records)
}

/// Structured-API parsing of the eCFR structure document. Every non-reserved
/// `part` node becomes one record; its section range spans the first and
/// last section identifiers beneath it.
pub fn parse_api(body: &[u8], ctx: &ParseContext<'_>) -> Option<Vec<RegulationRecord>> {
    let root: Value = serde_json::from_slice(body).ok()?;
    let root = root.get("structure").unwrap_or(&root);

    let mut records = Vec::new();
    walk_api(root, "", "", ctx.fetched_at, &mut records);
    finish(records)
}

fn walk_api(
    node: &Value,
    chapter: &str,
    subchapter: &str,
    fetched_at: i64,
    out: &mut Vec<RegulationRecord>,
) {
    let kind = node.get("type").and_then(Value::as_str).unwrap_or("");
    let identifier = node.get("identifier").and_then(Value::as_str).unwrap_or("");
    let reserved = node.get("reserved").and_then(Value::as_bool).unwrap_or(false);

    let (chapter, subchapter) = match kind {
        "chapter" => (identifier.to_string(), String::new()),
        "subchapter" => (chapter.to_string(), identifier.to_string()),
        _ => (chapter.to_string(), subchapter.to_string()),
    };

    if kind == "part" {
        if !reserved && !identifier.is_empty() {
            let description = node
                .get("label_description")
                .and_then(Value::as_str)
                .unwrap_or("");
            let mut sections = Vec::new();
            collect_sections(node, &mut sections);
            let section_range = match (sections.first(), sections.last()) {
                (Some(first), Some(last)) if first != last => format!("{} - {}", first, last),
                (Some(only), _) => only.clone(),
                _ => String::new(),
            };
            let url = api_part_url(&chapter, &subchapter, identifier);
            out.push(RegulationRecord::new(
                TITLE,
                &prefixed("Chapter", &chapter),
                &prefixed("Subchapter", &subchapter),
                &prefixed("Part", identifier),
                &section_range,
                description,
                &url,
                fetched_at,
            ));
        }
        return;
    }

    if let Some(children) = node.get("children").and_then(Value::as_array) {
        for child in children {
            walk_api(child, &chapter, &subchapter, fetched_at, out);
        }
    }
}

fn collect_sections(node: &Value, out: &mut Vec<String>) {
    if let Some(children) = node.get("children").and_then(Value::as_array) {
        for child in children {
            let kind = child.get("type").and_then(Value::as_str).unwrap_or("");
            if kind == "section" {
                if let Some(id) = child.get("identifier").and_then(Value::as_str) {
                    out.push(id.to_string());
                }
            } else {
                collect_sections(child, out);
            }
        }
    }
}

fn api_part_url(chapter: &str, subchapter: &str, part: &str) -> String {
    let mut url = TITLE_PATH.to_string();
    if !chapter.is_empty() {
        url.push_str(&format!("/chapter-{}", chapter));
    }
    if !subchapter.is_empty() {
        url.push_str(&format!("/subchapter-{}", subchapter));
    }
    url.push_str(&format!("/part-{}", part));
    url
}

fn prefixed(label: &str, value: &str) -> String {
    if value.is_empty() {
        String::new()
    } else {
        format!("{} {}", label, value)
    }
}

/// Drop invalid records and locator duplicates; `None` if nothing survives.
fn finish(records: Vec<RegulationRecord>) -> Option<Vec<RegulationRecord>> {
    let mut seen = HashSet::new();
    let kept: Vec<RegulationRecord> = records
        .into_iter()
        .filter(|r| r.is_valid() && seen.insert(r.id))
        .collect();
    if kept.is_empty() {
        None
    } else {
        Some(kept)
    }
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn element_text(element: &ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Resolve an href against the eCFR host.
pub fn normalize_url(href: &str) -> String {
    if href.is_empty() {
        String::new()
    } else if href.starts_with("http") {
        href.to_string()
    } else if href.starts_with('/') {
        format!("{}{}", ECFR_HOST, href)
    } else {
        format!("{}/{}", ECFR_HOST, href)
    }
}

/// `(.../chapter-I/subchapter-H/...)` → `("Chapter I", "Subchapter H")`.
fn locators_from_path(url: &str) -> (String, String) {
    let mut chapter = String::new();
    let mut subchapter = String::new();
    for segment in url.split('/') {
        if let Some(id) = segment.strip_prefix("subchapter-") {
            subchapter = format!("Subchapter {}", id);
        } else if let Some(id) = segment.strip_prefix("chapter-") {
            chapter = format!("Chapter {}", id);
        }
    }
    (chapter, subchapter)
}
