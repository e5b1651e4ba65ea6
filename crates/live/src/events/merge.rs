//! Folding the two upstream event feeds into one taxonomy.
//!
//! Both feeds key on the same event id space. Each id accumulates into a
//! mutable draft; drafts fill empty fields only, so the richer deviation
//! feed (folded first) is never overwritten by the reason-coded message
//! feed. The draft is discarded after finalization.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::identifiers::EventIdentifier;
use crate::models::types::{EventSource, Severity, TrafficEvent};
use crate::network::types::{RawDeviation, RawRouteSection, RawTrainMessage, StationDirectory};

/// Fallback title when neither feed carried one.
const UNTITLED_EVENT: &str = "Trafikhändelse";

/// Swedish impact tier for a worst-case score.
fn impact_label(score: u8) -> &'static str {
    match score {
        s if s >= 4 => "Mycket stor påverkan",
        3 => "Stor påverkan",
        2 => "Viss påverkan",
        _ => "Liten påverkan",
    }
}

pub(crate) struct EventDraft {
    id: EventIdentifier,
    title: Option<String>,
    description: Option<String>,
    /// Worst score observed so far. Only ever rises across partial updates.
    score: Option<u8>,
    sections: Vec<RawRouteSection>,
    starts_at: Option<String>,
    ends_at: Option<String>,
    updated_at: Option<String>,
    source: EventSource,
}

impl EventDraft {
    fn new(id: EventIdentifier, source: EventSource) -> Self {
        Self {
            id,
            title: None,
            description: None,
            score: None,
            sections: Vec::new(),
            starts_at: None,
            ends_at: None,
            updated_at: None,
            source,
        }
    }

    fn bump_score(&mut self, candidate: Option<u8>) {
        if let Some(candidate) = candidate {
            self.score = Some(self.score.map_or(candidate, |s| s.max(candidate)));
        }
    }

    fn absorb_deviation(&mut self, deviation: &RawDeviation) {
        fill(&mut self.title, &deviation.header);
        fill(&mut self.description, &deviation.message);
        fill(&mut self.starts_at, &deviation.start_time);
        fill(&mut self.ends_at, &deviation.end_time);
        fill(&mut self.updated_at, &deviation.modified_time);
        self.bump_score(deviation.impact_score);
        for section in &deviation.sections {
            self.bump_score(section.impact_score);
        }
        self.sections.extend(deviation.sections.iter().cloned());
    }

    fn absorb_message(&mut self, message: &RawTrainMessage) {
        fill(&mut self.title, &message.header);
        fill(
            &mut self.description,
            &message.message.clone().or_else(|| message.reason_code.clone()),
        );
        fill(&mut self.starts_at, &message.start_time);
        fill(&mut self.updated_at, &message.modified_time);
        for section in &message.sections {
            self.bump_score(section.impact_score);
        }
        self.sections.extend(message.sections.iter().cloned());
    }

    fn finalize(self, directory: &StationDirectory) -> TrafficEvent {
        let segment = segment_label(&self.sections, directory);
        TrafficEvent {
            id: self.id,
            title: Arc::from(self.title.as_deref().unwrap_or(UNTITLED_EVENT)),
            description: self.description.map(Arc::from),
            severity: Severity::from_score(self.score.unwrap_or(0)),
            impact_label: self.score.map(|s| Arc::from(impact_label(s))),
            segment,
            starts_at: parse_timestamp(self.starts_at.as_deref()),
            ends_at: parse_timestamp(self.ends_at.as_deref()),
            updated_at: parse_timestamp(self.updated_at.as_deref()),
            source: self.source,
        }
    }
}

/// Fill an empty slot; never overwrite an earlier-set value.
fn fill(slot: &mut Option<String>, candidate: &Option<String>) {
    if slot.is_none()
        && let Some(value) = candidate
        && !value.is_empty()
    {
        *slot = Some(value.clone());
    }
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Resolve a station signature to its display name, defaulting to the raw
/// signature when the lookup has no entry for it.
fn resolve<'a>(directory: &'a StationDirectory, signature: &'a str) -> &'a str {
    directory.get(signature).map(String::as_str).unwrap_or(signature)
}

fn usable(signature: &Option<String>) -> Option<&str> {
    signature.as_deref().filter(|s| !s.is_empty())
}

/// First usable "from → to" across the accumulated sections, falling back
/// to "Mot X", then "Vid X".
fn segment_label(sections: &[RawRouteSection], directory: &StationDirectory) -> Option<Arc<str>> {
    for section in sections {
        if let (Some(from), Some(to)) = (usable(&section.from_signature), usable(&section.to_signature)) {
            return Some(Arc::from(format!(
                "{} → {}",
                resolve(directory, from),
                resolve(directory, to)
            )));
        }
    }
    for section in sections {
        if let Some(to) = usable(&section.to_signature) {
            return Some(Arc::from(format!("Mot {}", resolve(directory, to))));
        }
    }
    for section in sections {
        if let Some(at) = usable(&section.at_signature) {
            return Some(Arc::from(format!("Vid {}", resolve(directory, at))));
        }
    }
    None
}

/// Fold both feeds into finished events. Order of the result is first
/// appearance; the store sorts by severity afterwards.
pub(crate) fn merge_feeds(
    deviations: &[RawDeviation],
    messages: &[RawTrainMessage],
    directory: &StationDirectory,
) -> Vec<TrafficEvent> {
    let mut drafts: HashMap<EventIdentifier, EventDraft> = HashMap::new();
    let mut order: Vec<EventIdentifier> = Vec::new();

    for deviation in deviations {
        if deviation.id.is_empty() {
            continue;
        }
        let id = EventIdentifier::new(&deviation.id);
        let draft = drafts.entry(id.clone()).or_insert_with(|| {
            order.push(id.clone());
            EventDraft::new(id.clone(), EventSource::Deviations)
        });
        draft.absorb_deviation(deviation);
    }

    for message in messages {
        if message.id.is_empty() {
            continue;
        }
        let id = EventIdentifier::new(&message.id);
        match drafts.get_mut(&id) {
            Some(draft) => {
                // Both feeds reference the same underlying event.
                if draft.source == EventSource::Deviations {
                    draft.source = EventSource::Merged;
                }
                draft.absorb_message(message);
            }
            None => {
                order.push(id.clone());
                let draft = drafts
                    .entry(id.clone())
                    .or_insert_with(|| EventDraft::new(id, EventSource::Messages));
                draft.absorb_message(message);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|id| drafts.remove(&id))
        .map(|draft| draft.finalize(directory))
        .collect()
}
