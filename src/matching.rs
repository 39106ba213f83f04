use std::collections::BTreeMap;

use hyper::{HeaderMap, Uri};

use crate::{
    archive::Recording,
    wire::{Request, Response},
};

/// Similarity between two key → value-list mappings:
///
/// ```text
/// ratio = 2 * (M + 1) / (|a| + |b|)
/// ```
///
/// where `M` counts the keys whose value lists compare equal on both sides.
/// The offset keeps the ratio positive even when nothing matches, so a
/// candidate that matched on path alone can still win when no better one
/// exists. Two empty mappings compare as positive infinity.
///
/// The same computation ranks candidate URLs by their query parameters and
/// candidate recordings by their headers.
pub fn similarity_ratio<K: Ord, V: Eq>(
    incoming: &BTreeMap<K, Vec<V>>,
    candidate: &BTreeMap<K, Vec<V>>,
) -> f64 {
    let mut matches = 1usize;
    for (key, values) in incoming {
        if candidate
            .get(key)
            .is_some_and(|candidate_values| candidate_values == values)
        {
            matches += 1;
        }
    }
    let total = incoming.len() + candidate.len();
    2.0 * matches as f64 / total as f64
}

/// Query parameters as raw `name` → value-list pairs, in order of
/// appearance per name. No percent-decoding is applied, so values compare
/// byte-for-byte as recorded.
pub fn query_values(query: Option<&str>) -> BTreeMap<String, Vec<String>> {
    let mut values: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let Some(query) = query else {
        return values;
    };
    for segment in query.split('&') {
        if segment.is_empty() {
            continue;
        }
        let mut parts = segment.splitn(2, '=');
        let name = parts.next().unwrap_or_default();
        let value = parts.next().unwrap_or_default();
        values
            .entry(name.to_owned())
            .or_default()
            .push(value.to_owned());
    }
    values
}

pub fn header_values(headers: &HeaderMap) -> BTreeMap<String, Vec<Vec<u8>>> {
    let mut values: BTreeMap<String, Vec<Vec<u8>>> = BTreeMap::new();
    for (name, value) in headers {
        values
            .entry(name.as_str().to_owned())
            .or_default()
            .push(value.as_bytes().to_vec());
    }
    values
}

/// Scans URL strings for the one whose path equals the incoming path and
/// whose query parameters score highest. Equal scores go to the
/// lexicographically smaller URL, so the winner never depends on map
/// iteration order.
pub(crate) fn closest_url<'a>(
    urls: impl Iterator<Item = &'a String>,
    incoming: &Request,
) -> Option<&'a String> {
    let incoming_query = query_values(incoming.uri().query());
    let mut best: Option<(&'a String, f64)> = None;

    for url in urls {
        let Ok(parsed) = url.parse::<Uri>() else {
            tracing::warn!("skipping unparseable archive url `{url}`");
            continue;
        };
        if parsed.path() != incoming.uri().path() {
            continue;
        }

        let ratio = similarity_ratio(&incoming_query, &query_values(parsed.query()));
        let better = match best {
            None => true,
            Some((best_url, best_ratio)) => {
                ratio > best_ratio || (ratio == best_ratio && url < best_url)
            }
        };
        if better {
            best = Some((url, ratio));
        }
    }

    best.map(|(url, _)| url)
}

/// Picks the best recording from a list sharing one URL.
///
/// A single-entry list is returned as-is. Longer lists are ranked by header
/// similarity after discarding recordings whose method differs; ties go to
/// the earliest recording, preserving record order. In chronological mode a
/// recording not yet served to this client in session `session_id` is
/// preferred, and the winner is stamped as served so repeated queries walk
/// the list in the order it was recorded.
pub(crate) fn select_from_recordings(
    url: &str,
    recordings: &[Recording],
    incoming: &Request,
    remote_addr: &str,
    session_id: u32,
    chronological: bool,
) -> Option<(Request, Response)> {
    if recordings.len() == 1 {
        return match recordings[0].unpack() {
            Ok(pair) => Some(pair),
            Err(err) => {
                tracing::warn!("skipping recording for {url}: {err}");
                None
            }
        };
    }

    let incoming_headers = header_values(incoming.headers());
    let mut best: Option<(usize, f64)> = None;
    let mut best_in_sequence: Option<(usize, f64)> = None;

    for (index, recording) in recordings.iter().enumerate() {
        let (request, _) = match recording.unpack() {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!("skipping recording #{index} for {url}: {err}");
                continue;
            }
        };
        if request.method() != incoming.method() {
            continue;
        }

        let ratio = similarity_ratio(&incoming_headers, &header_values(request.headers()));
        if chronological
            && recording.last_served_session.get(remote_addr) != session_id
            && best_in_sequence.is_none_or(|(_, best_ratio)| ratio > best_ratio)
        {
            best_in_sequence = Some((index, ratio));
        }
        if best.is_none_or(|(_, best_ratio)| ratio > best_ratio) {
            best = Some((index, ratio));
        }
    }

    let (index, _) = if chronological {
        best_in_sequence.or(best)?
    } else {
        best?
    };
    let chosen = &recordings[index];
    let pair = match chosen.unpack() {
        Ok(pair) => pair,
        Err(err) => {
            tracing::warn!("skipping recording #{index} for {url}: {err}");
            return None;
        }
    };
    chosen.last_served_session.set(remote_addr, session_id);
    Some(pair)
}
