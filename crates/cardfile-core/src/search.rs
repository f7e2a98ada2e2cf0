//! Substring and fuzzy contact search.
//!
//! Matching is case-insensitive across name, email, and phone. Substring
//! hits rank first with distance zero; fuzzy hits use the classic dynamic
//! programming edit distance, taken per word so a typo in one word of a
//! long name still matches. Callers hand in the contact copies they got
//! from the roster; this module never touches storage.

use serde::{Deserialize, Serialize};

use crate::model::Contact;

/// One match, carrying how far the query was from the matched text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub contact: Contact,
    /// Zero for a substring hit, otherwise the smallest per-word edit
    /// distance over all searched fields.
    pub distance: usize,
}

/// Edit distance between two strings, counted in characters.
#[must_use]
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    // Two-row DP over the full matrix.
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            current[j + 1] = (prev[j + 1] + 1)
                .min(current[j] + 1)
                .min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

/// Smallest distance between the query and any word of `text`.
fn field_distance(text: &str, query: &str) -> usize {
    let text = text.to_lowercase();
    if text.contains(query) {
        return 0;
    }
    text.split(|c: char| !c.is_alphanumeric() && c != '@' && c != '.')
        .filter(|w| !w.is_empty())
        .map(|word| edit_distance(word, query))
        .min()
        .unwrap_or(usize::MAX)
}

/// Best distance for one contact across all searched fields.
fn contact_distance(contact: &Contact, query: &str) -> usize {
    let mut best = field_distance(&contact.name, query);
    if let Some(email) = &contact.email {
        best = best.min(field_distance(email, query));
    }
    if let Some(phone) = &contact.phone {
        best = best.min(field_distance(phone, query));
    }
    best
}

/// Rank contacts against a query, keeping hits within `max_distance`.
///
/// Results come back best first: by distance, then by name, then by id so
/// equal inputs always rank identically. An empty query matches nothing.
#[must_use]
pub fn rank(contacts: &[Contact], query: &str, max_distance: usize) -> Vec<SearchHit> {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return Vec::new();
    }

    let mut hits: Vec<SearchHit> = contacts
        .iter()
        .filter_map(|contact| {
            let distance = contact_distance(contact, &query);
            (distance <= max_distance).then(|| SearchHit {
                contact: contact.clone(),
                distance,
            })
        })
        .collect();
    hits.sort_by(|a, b| {
        a.distance
            .cmp(&b.distance)
            .then_with(|| {
                a.contact
                    .name
                    .to_lowercase()
                    .cmp(&b.contact.name.to_lowercase())
            })
            .then_with(|| a.contact.id.cmp(&b.contact.id))
    });
    hits
}

/// Exact substring matches only. Sugar over [`rank`] with zero tolerance.
#[must_use]
pub fn substring(contacts: &[Contact], query: &str) -> Vec<SearchHit> {
    rank(contacts, query, 0)
}
