//! Text rewriting applied to card bodies and comments on their way into GitLab.
//!
//! Every function here is free of I/O, leaves empty input untouched, and is
//! idempotent: feeding its output back in yields the same text.

use std::collections::{HashMap, HashSet};

use chrono::DateTime;
use regex::{Captures, Regex};

use super::attachments::AttachmentMapping;
use crate::model::source::{
    CustomFieldDefinition, CustomFieldKind, CustomFieldValue, SourceCard, SourceChecklist,
};

/// Fixed tag identifying migration marker notes. Never configurable.
pub const MARKER_TOKEN: &str = "trellab-migration-marker:3f9b6c1e2d7a4058";
pub const MARKER_PHRASE: &str = "Migrated from Trello card";
pub const CUSTOM_FIELDS_HEADING: &str = "### Custom Fields";
pub const ATTACHMENTS_HEADING: &str = "### Attachments";

/// Body of the note linking an issue back to its card. The token sits in an
/// HTML comment so it does not render.
pub fn marker_note(card: &SourceCard, link_base: &str) -> String {
    let url = card
        .short_url
        .clone()
        .unwrap_or_else(|| format!("{link_base}/c/{}", card.short_link));
    format!(
        "<!-- {MARKER_TOKEN} -->\n{MARKER_PHRASE} {url} (card id `{}`, list id `{}`)",
        card.id, card.id_list
    )
}

/// True for any text the marker rewriting must leave alone.
pub fn is_marker(body: &str) -> bool {
    body.contains(MARKER_TOKEN) || body.contains(MARKER_PHRASE)
}

pub fn has_marker_token(body: &str) -> bool {
    body.contains(MARKER_TOKEN)
}

/// Whether `body` is a marker for the card with this raw id.
pub fn marks_card(body: &str, card_id: &str) -> bool {
    !card_id.is_empty() && body.contains(MARKER_TOKEN) && body.contains(card_id)
}

/// Append a markdown section after `text`, separated by a blank line.
pub fn append_section(text: &str, section: &str) -> String {
    let base = text.trim_end();
    if base.is_empty() {
        section.to_string()
    } else {
        format!("{base}\n\n{section}")
    }
}

/// Replace `@source` with `@target` for each pair, in the order given.
///
/// Matching is case-insensitive and needs a word boundary after the name; an
/// `@` preceded by a word character (an email address) is not a mention.
pub fn rewrite_mentions(text: &str, pairs: &[(String, String)]) -> String {
    if text.is_empty() || pairs.is_empty() {
        return text.to_string();
    }
    let mut out = text.to_string();
    for (source, target) in pairs {
        if source.is_empty() {
            continue;
        }
        let re = match Regex::new(&format!(r"(?i)\B@{}\b", regex::escape(source))) {
            Ok(r) => r,
            Err(_) => continue,
        };
        let replacement = format!("@{target}");
        let mut rewritten = String::with_capacity(out.len());
        let mut last = 0;
        for m in re.find_iter(&out) {
            rewritten.push_str(&out[last..m.start()]);
            // Already rewritten when the target name extends the source name.
            if out[m.start()..].starts_with(&replacement) {
                rewritten.push_str(m.as_str());
            } else {
                rewritten.push_str(&replacement);
            }
            last = m.end();
        }
        rewritten.push_str(&out[last..]);
        out = rewritten;
    }
    out
}

/// Substitute rehosted URLs for the source URLs found in `text`.
pub fn replace_attachment_urls(text: &str, mappings: &mut [AttachmentMapping]) -> String {
    if text.is_empty() {
        return String::new();
    }
    let mut out = text.to_string();
    for mapping in mappings.iter_mut() {
        let Some(upload) = &mapping.upload else {
            continue;
        };
        let source_url = mapping.attachment.url.as_str();
        if !source_url.is_empty() && out.contains(source_url) {
            out = out.replace(source_url, &upload.url);
        }
        if out.contains(&upload.url) {
            mapping.replaced = true;
        }
    }
    out
}

/// "### Attachments" section for every mapping that never made it into the text.
/// Failed uploads fall back to the original link.
pub fn attachment_section(mappings: &[AttachmentMapping]) -> Option<String> {
    let lines: Vec<String> = mappings
        .iter()
        .filter(|m| !m.replaced)
        .map(|m| match &m.upload {
            Some(upload) => format!("- {}", upload.markdown),
            None => format!("- [{}]({})", m.attachment.name, m.attachment.url),
        })
        .collect();
    if lines.is_empty() {
        return None;
    }
    Some(format!("{ATTACHMENTS_HEADING}\n\n{}", lines.join("\n")))
}

fn render_field_value(def: &CustomFieldDefinition, value: &CustomFieldValue) -> Option<String> {
    let text = match def.kind {
        CustomFieldKind::List => {
            let option_id = value.id_value.as_deref()?;
            def.options
                .iter()
                .find(|o| o.id == option_id)?
                .value
                .text
                .clone()?
        }
        CustomFieldKind::Checkbox => {
            let checked = value.value.as_ref()?.checked.as_deref()?;
            if checked != "true" {
                return None;
            }
            "Yes".to_string()
        }
        CustomFieldKind::Text => value.value.as_ref()?.text.clone()?,
        CustomFieldKind::Number => value.value.as_ref()?.number.clone()?,
        CustomFieldKind::Date => {
            let raw = value.value.as_ref()?.date.clone()?;
            DateTime::parse_from_rfc3339(&raw)
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or(raw)
        }
    };
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// "### Custom Fields" section, or `None` when there is nothing to add or the
/// description already carries one.
pub fn custom_fields_section(
    description: &str,
    definitions: &[CustomFieldDefinition],
    values: &[CustomFieldValue],
) -> Option<String> {
    if definitions.is_empty() || values.is_empty() || description.contains(CUSTOM_FIELDS_HEADING)
    {
        return None;
    }
    let lines: Vec<String> = definitions
        .iter()
        .filter_map(|def| {
            let value = values.iter().find(|v| v.id_custom_field == def.id)?;
            let text = render_field_value(def, value)?;
            Some(format!("- **{}**: {text}", def.name))
        })
        .collect();
    if lines.is_empty() {
        return None;
    }
    Some(format!("{CUSTOM_FIELDS_HEADING}\n\n{}", lines.join("\n")))
}

/// One section per checklist of the card whose heading is not already in `existing`.
pub fn checklists_section(
    existing: &str,
    card_id: &str,
    checklists: &[SourceChecklist],
) -> Option<String> {
    let mut lists: Vec<&SourceChecklist> = checklists
        .iter()
        .filter(|c| c.id_card == card_id)
        .collect();
    lists.sort_by(|a, b| a.pos.total_cmp(&b.pos));

    let sections: Vec<String> = lists
        .into_iter()
        .filter_map(|checklist| {
            let heading = format!("### {}", checklist.name);
            if existing.lines().any(|l| l.trim_end() == heading) {
                return None;
            }
            let mut items: Vec<_> = checklist.check_items.iter().collect();
            items.sort_by(|a, b| a.pos.total_cmp(&b.pos));
            let mut section = heading;
            if !items.is_empty() {
                section.push_str("\n\n");
                let lines: Vec<String> = items
                    .iter()
                    .map(|item| {
                        let mark = if item.is_complete() { "x" } else { " " };
                        format!("- [{mark}] {}", item.name)
                    })
                    .collect();
                section.push_str(&lines.join("\n"));
            }
            Some(section)
        })
        .collect();

    if sections.is_empty() {
        None
    } else {
        Some(sections.join("\n\n"))
    }
}

/// Card body followed by its checklists and custom fields, each added once.
pub fn build_description(
    card: &SourceCard,
    checklists: &[SourceChecklist],
    definitions: &[CustomFieldDefinition],
    values: &[CustomFieldValue],
) -> String {
    let mut description = card.desc.trim_end().to_string();
    if let Some(section) = checklists_section(&description, &card.id, checklists) {
        description = append_section(&description, &section);
    }
    if let Some(section) = custom_fields_section(&description, definitions, values) {
        description = append_section(&description, &section);
    }
    description
}

/// What a card link should become.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTarget {
    Issue(u64),
    /// Card left out by the inclusion filter.
    Excluded,
    Unresolved,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rewritten {
    pub text: String,
    /// Short-links of excluded cards that were left in place.
    pub skipped: Vec<String>,
}

/// Rewrites card URLs into `#iid` issue references.
pub struct CrossLinks {
    markdown: Regex,
    bare: Regex,
}

impl CrossLinks {
    pub fn new(link_base: &str) -> Result<Self, regex::Error> {
        let host = link_base
            .trim_end_matches('/')
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        // The slug never ends in sentence punctuation.
        let url = format!(
            r"https?://{}/c/([A-Za-z0-9]+)(?:/(?:[^\s\)\]]*[^\s\)\]\.,;:!?])?)?",
            regex::escape(host)
        );
        Ok(Self {
            markdown: Regex::new(&format!(r"\[([^\[\]]*)\]\(({url})\)"))?,
            bare: Regex::new(&url)?,
        })
    }

    pub fn rewrite(&self, text: &str, targets: &HashMap<String, LinkTarget>) -> Rewritten {
        if text.is_empty() || is_marker(text) {
            return Rewritten {
                text: text.to_string(),
                skipped: Vec::new(),
            };
        }

        let mut skipped = Vec::new();
        let mut issue_for = |short_link: &str| -> Option<u64> {
            match targets.get(short_link) {
                Some(LinkTarget::Issue(iid)) => Some(*iid),
                Some(LinkTarget::Excluded) => {
                    skipped.push(short_link.to_string());
                    None
                }
                Some(LinkTarget::Unresolved) | None => None,
            }
        };

        // A labelled link keeps its label next to the reference.
        let linked = self.markdown.replace_all(text, |caps: &Captures| {
            let label = caps[1].trim();
            match issue_for(&caps[3]) {
                Some(iid) if label.is_empty() || label == &caps[2] => format!("#{iid}"),
                Some(iid) => format!("{label} (#{iid})"),
                None => caps[0].to_string(),
            }
        });
        let bare = self
            .bare
            .replace_all(&linked, |caps: &Captures| match issue_for(&caps[1]) {
                Some(iid) => format!("#{iid}"),
                None => caps[0].to_string(),
            })
            .into_owned();

        let mut seen = HashSet::new();
        skipped.retain(|s| seen.insert(s.clone()));
        Rewritten {
            text: bare,
            skipped,
        }
    }
}
