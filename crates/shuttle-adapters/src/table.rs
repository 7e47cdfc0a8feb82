//! `<table>` to rectangular text grid, with `colspan`/`rowspan` expanded.

use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};

use crate::AdapterError;

const MAX_SPAN: usize = 64;
const CONTEXT_LEVELS: usize = 3;
const SIBLINGS_PER_LEVEL: usize = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimetableGrid {
    pub rows: Vec<Vec<String>>,
    /// Caption and preceding heading-like texts, nearest first.
    pub context: Vec<String>,
}

impl TimetableGrid {
    pub fn new<S: Into<String>>(
        rows: Vec<Vec<String>>,
        context: impl IntoIterator<Item = S>,
    ) -> Self {
        let width = rows.iter().map(Vec::len).max().unwrap_or(0);
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, String::new());
                row
            })
            .collect();
        Self {
            rows,
            context: context
                .into_iter()
                .map(Into::into)
                .filter(|part: &String| !part.is_empty())
                .collect(),
        }
    }

    pub fn width(&self) -> usize {
        self.rows.first().map(Vec::len).unwrap_or(0)
    }

    pub fn cell(&self, row: usize, col: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .map(String::as_str)
            .unwrap_or("")
    }
}

pub(crate) fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))
}

pub fn extract_grids(html: &str) -> Result<Vec<TimetableGrid>, AdapterError> {
    let document = Html::parse_document(html);
    let table_sel = parse_selector("table")?;
    let row_sel = parse_selector("tr")?;
    let caption_sel = parse_selector("caption")?;

    let mut grids = Vec::new();
    for table in document.select(&table_sel) {
        let rows = table
            .select(&row_sel)
            .filter(|tr| owning_table(*tr) == Some(table))
            .collect::<Vec<_>>();
        if rows.is_empty() {
            continue;
        }
        let caption = table
            .select(&caption_sel)
            .next()
            .map(element_text)
            .unwrap_or_default();
        let context = std::iter::once(caption).chain(heading_context(table));
        grids.push(TimetableGrid::new(expand_rows(&rows), context));
    }
    Ok(grids)
}

fn owning_table(tr: ElementRef<'_>) -> Option<ElementRef<'_>> {
    tr.ancestors()
        .filter_map(ElementRef::wrap)
        .find(|e| e.value().name() == "table")
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(el: ElementRef<'_>) -> String {
    collapse_whitespace(&el.text().collect::<Vec<_>>().join(" "))
}

fn is_cell(el: &ElementRef<'_>) -> bool {
    matches!(el.value().name(), "td" | "th")
}

fn span_attr(el: ElementRef<'_>, name: &str) -> usize {
    el.value()
        .attr(name)
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(1)
        .clamp(1, MAX_SPAN)
}

fn take_carried(carried: &mut [Option<(usize, String)>], col: usize) -> Option<String> {
    let slot = carried.get_mut(col)?;
    let (remaining, text) = slot.take()?;
    if remaining > 1 {
        *slot = Some((remaining - 1, text.clone()));
    }
    Some(text)
}

fn expand_rows(rows: &[ElementRef<'_>]) -> Vec<Vec<String>> {
    // Column-indexed rowspan carry: (rows still to fill, text).
    let mut carried: Vec<Option<(usize, String)>> = Vec::new();
    let mut grid = Vec::with_capacity(rows.len());

    for tr in rows {
        let mut cells = tr.children().filter_map(ElementRef::wrap).filter(is_cell);
        let mut out: Vec<String> = Vec::new();
        loop {
            let col = out.len();
            if let Some(text) = take_carried(&mut carried, col) {
                out.push(text);
                continue;
            }
            let Some(cell) = cells.next() else {
                if carried.iter().skip(col).any(Option::is_some) {
                    out.push(String::new());
                    continue;
                }
                break;
            };
            let text = element_text(cell);
            let rowspan = span_attr(cell, "rowspan");
            for _ in 0..span_attr(cell, "colspan") {
                let at = out.len();
                if rowspan > 1 {
                    if carried.len() <= at {
                        carried.resize(at + 1, None);
                    }
                    carried[at] = Some((rowspan - 1, text.clone()));
                }
                out.push(text.clone());
            }
        }
        grid.push(out);
    }
    grid
}

/// Preceding sibling texts at the table and its first ancestors, nearest
/// first. A level's walk stops at a sibling holding another table, whose
/// headings belong to that table.
fn heading_context(table: ElementRef<'_>) -> Vec<String> {
    let mut parts = Vec::new();
    let mut level = Some(*table);
    for _ in 0..CONTEXT_LEVELS {
        let Some(node) = level else { break };
        let mut taken = 0;
        for sibling in node.prev_siblings() {
            let text = match sibling.value() {
                Node::Text(text) => collapse_whitespace(text),
                Node::Element(e) if matches!(e.name(), "script" | "style") => continue,
                Node::Element(_) => {
                    let Some(el) = ElementRef::wrap(sibling) else { continue };
                    if holds_table(el) {
                        break;
                    }
                    element_text(el)
                }
                _ => continue,
            };
            if text.is_empty() {
                continue;
            }
            parts.push(text);
            taken += 1;
            if taken == SIBLINGS_PER_LEVEL {
                break;
            }
        }
        level = node.parent();
    }
    parts
}

fn holds_table(el: ElementRef<'_>) -> bool {
    el.value().name() == "table"
        || el
            .descendants()
            .filter_map(ElementRef::wrap)
            .any(|d| d.value().name() == "table")
}
