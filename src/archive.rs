use std::{
    collections::BTreeMap,
    fs::File,
    io::{Read as _, Write},
    path::Path,
    sync::{Mutex, MutexGuard},
};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use hyper::Uri;
use serde::{Deserialize, Serialize};

use crate::{
    encoding,
    error::ArchiveError,
    matching,
    session::{ClientSessions, SessionCell},
    wire::{self, Request, Response},
};

pub const DEFAULT_NEGOTIATED_PROTOCOL: &str = "http/1.1";

/// One recorded exchange: the request and response in their canonical wire
/// form, plus the session in which this recording was last served to each
/// client. The wire bytes never change after creation; only the session
/// counters do.
#[derive(Debug, Serialize, Deserialize)]
pub struct Recording {
    #[serde(rename = "SerializedRequest", with = "encoding::base64_bytes")]
    request_bytes: Vec<u8>,
    #[serde(rename = "SerializedResponse", with = "encoding::base64_bytes")]
    response_bytes: Vec<u8>,
    #[serde(rename = "LastServedSession", default)]
    pub(crate) last_served_session: SessionCell,
}

impl Recording {
    pub fn new(url: &str, request: &Request, response: &Response) -> Result<Self, ArchiveError> {
        let request_bytes = wire::serialize_request(request)
            .map_err(|err| ArchiveError::Serialization(format!("write request for {url}: {err}")))?;
        let response_bytes = wire::serialize_response(response, request.method())
            .map_err(|err| ArchiveError::Serialization(format!("write response for {url}: {err}")))?;
        Ok(Self {
            request_bytes,
            response_bytes,
            last_served_session: SessionCell::default(),
        })
    }

    /// Decodes the wire bytes back into an exchange. The request is parsed
    /// first so the response parser knows whether a body is expected.
    pub fn unpack(&self) -> Result<(Request, Response), ArchiveError> {
        let request = wire::parse_request(&self.request_bytes)?;
        let response = wire::parse_response(&self.response_bytes, request.method())?;
        Ok((request, response))
    }

    pub fn request_bytes(&self) -> &[u8] {
        &self.request_bytes
    }

    pub fn response_bytes(&self) -> &[u8] {
        &self.response_bytes
    }
}

/// Counts reported by [`Archive::merge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub added: usize,
    pub duplicates: usize,
}

/// An archive of recorded HTTP exchanges, indexed host → absolute URL →
/// recordings in record order.
///
/// Replay works against a logically frozen index: after [`Archive::open`]
/// the maps are never restructured, and the only state [`Archive::find`]
/// mutates is session counters, each behind its own lock. Recording goes
/// through [`WritableArchive`], which serializes writers with a mutex.
#[derive(Debug, Serialize, Deserialize)]
pub struct Archive {
    #[serde(
        rename = "Requests",
        default,
        deserialize_with = "encoding::null_to_default"
    )]
    requests: BTreeMap<String, BTreeMap<String, Vec<Recording>>>,
    #[serde(rename = "Certs", default, with = "encoding::base64_map")]
    certs: BTreeMap<String, Vec<u8>>,
    #[serde(
        rename = "NegotiatedProtocol",
        default,
        deserialize_with = "encoding::null_to_default"
    )]
    negotiated_protocol: BTreeMap<String, String>,
    #[serde(rename = "DeterministicTimeSeedMs", default)]
    pub deterministic_time_seed_ms: i64,
    #[serde(rename = "ServeResponseInChronologicalSequence", default)]
    pub serve_in_chronological_sequence: bool,
    #[serde(rename = "CurrentSession", default)]
    current_session: SessionCell,
}

impl Archive {
    pub fn new() -> Self {
        Self {
            requests: BTreeMap::new(),
            certs: BTreeMap::new(),
            negotiated_protocol: BTreeMap::new(),
            deterministic_time_seed_ms: 0,
            serve_in_chronological_sequence: false,
            current_session: SessionCell::default(),
        }
    }

    /// Opens an archive previously written by [`WritableArchive::close`] and
    /// prepares it for replay.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|err| ArchiveError::Io(format!("open {}: {err}", path.display())))?;
        let mut payload = Vec::new();
        GzDecoder::new(file)
            .read_to_end(&mut payload)
            .map_err(|err| ArchiveError::Io(format!("gunzip {}: {err}", path.display())))?;
        let mut archive: Archive = serde_json::from_slice(&payload)
            .map_err(|err| ArchiveError::Decoding(format!("decode {}: {err}", path.display())))?;
        archive.prepare_for_replay();
        Ok(archive)
    }

    /// Resets all session state: clients start at session 1 while every
    /// recording reports 0 as its last served session, so nothing counts as
    /// already served in the session that begins now.
    pub fn prepare_for_replay(&mut self) {
        self.current_session = SessionCell::new(ClientSessions::new(1));
        for url_map in self.requests.values_mut() {
            for recordings in url_map.values_mut() {
                for recording in recordings.iter_mut() {
                    recording.last_served_session = SessionCell::new(ClientSessions::new(0));
                }
            }
        }
    }

    /// Gzip-compresses the archive document onto `writer`.
    pub fn serialize<W: Write>(&self, writer: W) -> Result<(), ArchiveError> {
        let mut encoder = GzEncoder::new(writer, Compression::default());
        serde_json::to_writer(&mut encoder, self)
            .map_err(|err| ArchiveError::Encoding(format!("encode archive: {err}")))?;
        encoder
            .finish()
            .map_err(|err| ArchiveError::Io(format!("finish gzip stream: {err}")))?;
        Ok(())
    }

    /// Records an exchange under its host and absolute URL. A request whose
    /// URL has no host is keyed by its `Host` header and `scheme`.
    pub fn add(
        &mut self,
        scheme: &str,
        request: &Request,
        response: &Response,
    ) -> Result<(), ArchiveError> {
        let host = wire::request_host(request)
            .ok_or_else(|| {
                ArchiveError::Serialization(format!("request for {} has no host", request.uri()))
            })?
            .to_owned();
        let url = absolute_url(request, &host, scheme);
        let recording = Recording::new(&url, request, response)?;
        self.requests
            .entry(host)
            .or_default()
            .entry(url)
            .or_default()
            .push(recording);
        Ok(())
    }

    /// Searches the archive for the recording that best matches `incoming`.
    ///
    /// Lookup tries the exact absolute URL first and falls back to the
    /// same-path URL with the most similar query parameters. Among
    /// recordings sharing the winning URL, header similarity decides, and in
    /// chronological-sequence mode clients walk multiple recordings of one
    /// URL in record order until they reset their session.
    pub fn find(
        &self,
        incoming: &Request,
        remote_addr: &str,
        scheme: &str,
    ) -> Result<(Request, Response), ArchiveError> {
        let Some(host) = wire::request_host(incoming) else {
            return Err(ArchiveError::NotFound);
        };
        let Some(host_map) = self.requests.get(host) else {
            return Err(ArchiveError::NotFound);
        };
        if host_map.is_empty() {
            return Err(ArchiveError::NotFound);
        }

        let session_id = self.current_session.get(remote_addr);
        let chronological = self.serve_in_chronological_sequence;

        let url = absolute_url(incoming, host, scheme);
        if let Some(recordings) = host_map.get(&url)
            && !recordings.is_empty()
        {
            return matching::select_from_recordings(
                &url,
                recordings,
                incoming,
                remote_addr,
                session_id,
                chronological,
            )
            .ok_or(ArchiveError::NotFound);
        }

        let Some(best_url) = matching::closest_url(host_map.keys(), incoming) else {
            return Err(ArchiveError::NotFound);
        };
        matching::select_from_recordings(
            best_url,
            &host_map[best_url],
            incoming,
            remote_addr,
            session_id,
            chronological,
        )
        .ok_or(ArchiveError::NotFound)
    }

    /// Starts a new session for `remote_addr`; the next chronological replay
    /// for that client re-enters the recording sequence from the start.
    pub fn reset_client_session(&self, remote_addr: &str) {
        self.current_session.increment(remote_addr);
    }

    /// Returns the recorded DER certificate and negotiated ALPN protocol for
    /// `host`. The protocol defaults to `http/1.1` when none was recorded.
    pub fn find_tls_config(&self, host: &str) -> Result<(&[u8], &str), ArchiveError> {
        let cert = self.certs.get(host).ok_or(ArchiveError::NotFound)?;
        let protocol = self
            .negotiated_protocol
            .get(host)
            .map(String::as_str)
            .unwrap_or(DEFAULT_NEGOTIATED_PROTOCOL);
        Ok((cert, protocol))
    }

    pub fn record_tls_config(&mut self, host: &str, cert_der: Vec<u8>, negotiated_protocol: &str) {
        // The first recorded certificate per host wins; the negotiated
        // protocol tracks whatever was seen last.
        self.certs.entry(host.to_owned()).or_insert(cert_der);
        self.negotiated_protocol
            .insert(host.to_owned(), negotiated_protocol.to_owned());
    }

    /// Visits every recording with its parsed URL, request, and response.
    /// Returning `false` from the visitor stops the walk. Recordings that no
    /// longer parse are logged and skipped.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&Uri, Request, Response) -> bool,
    {
        for url_map in self.requests.values() {
            for (url, recordings) in url_map {
                let parsed_url = match url.parse::<Uri>() {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        tracing::warn!("skipping unparseable archive url `{url}`: {err}");
                        continue;
                    }
                };
                for (index, recording) in recordings.iter().enumerate() {
                    let (request, response) = match recording.unpack() {
                        Ok(pair) => pair,
                        Err(err) => {
                            tracing::warn!("skipping recording #{index} for {url}: {err}");
                            continue;
                        }
                    };
                    if !visit(&parsed_url, request, response) {
                        return;
                    }
                }
            }
        }
    }

    /// Applies `edit` to every recording and collects the results into a new
    /// archive, leaving this one unchanged. Returning `Ok(None)` drops the
    /// exchange; an error stops the traversal and is surfaced.
    pub fn edit<F>(&self, mut edit: F) -> Result<Archive, ArchiveError>
    where
        F: FnMut(Request, Response) -> Result<Option<(Request, Response)>, ArchiveError>,
    {
        let mut edited = Archive::new();
        let mut failure = None;
        self.for_each(|url, request, response| match edit(request, response) {
            Err(err) => {
                failure = Some(err);
                false
            }
            Ok(None) => true,
            Ok(Some((new_request, new_response))) => {
                match edited.add(url.scheme_str().unwrap_or_default(), &new_request, &new_response)
                {
                    Ok(()) => true,
                    Err(err) => {
                        failure = Some(err);
                        false
                    }
                }
            }
        });
        match failure {
            Some(err) => Err(err),
            None => Ok(edited),
        }
    }

    /// Adds every recording of `other` that this archive cannot already
    /// answer. A matched recording whose parsed request differs from the
    /// incoming one is added as a variant under the same URL; an equal one
    /// counts as a duplicate and is skipped.
    pub fn merge(&mut self, other: &Archive) -> Result<MergeOutcome, ArchiveError> {
        let mut outcome = MergeOutcome::default();
        let mut failure = None;
        other.for_each(|url, request, response| {
            let scheme = url.scheme_str().unwrap_or_default();
            let should_add = match self.find(&request, "", scheme) {
                Err(_) => true,
                Ok((found_request, _)) => !requests_equivalent(&found_request, &request),
            };
            if should_add {
                if let Err(err) = self.add(scheme, &request, &response) {
                    failure = Some(err);
                    return false;
                }
                outcome.added += 1;
            } else {
                outcome.duplicates += 1;
            }
            true
        });
        if let Some(err) = failure {
            return Err(err);
        }
        tracing::info!(
            "merged recordings: added={} duplicates={}",
            outcome.added,
            outcome.duplicates
        );
        Ok(outcome)
    }
}

impl Default for Archive {
    fn default() -> Self {
        Self::new()
    }
}

/// The canonical lookup key: the request URL with scheme and host filled in
/// from the request when its own URL is relative.
fn absolute_url(request: &Request, host: &str, scheme: &str) -> String {
    let uri = request.uri();
    if uri.authority().is_some() {
        return uri.to_string();
    }
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{scheme}://{host}{path_and_query}")
}

fn requests_equivalent(a: &Request, b: &Request) -> bool {
    a.method() == b.method()
        && a.uri() == b.uri()
        && a.headers() == b.headers()
        && a.body() == b.body()
}

/// An archive opened for recording. All mutations go through one mutex, and
/// nothing reaches the output file until [`WritableArchive::close`].
#[derive(Debug)]
pub struct WritableArchive {
    state: Mutex<WritableState>,
}

#[derive(Debug)]
struct WritableState {
    archive: Archive,
    output: Option<File>,
}

impl WritableArchive {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let path = path.as_ref();
        let output = File::create(path)
            .map_err(|err| ArchiveError::Io(format!("create {}: {err}", path.display())))?;
        Ok(Self {
            state: Mutex::new(WritableState {
                archive: Archive::new(),
                output: Some(output),
            }),
        })
    }

    pub fn record_request(
        &self,
        scheme: &str,
        request: &Request,
        response: &Response,
    ) -> Result<(), ArchiveError> {
        self.lock_state().archive.add(scheme, request, response)
    }

    pub fn record_tls_config(&self, host: &str, cert_der: Vec<u8>, negotiated_protocol: &str) {
        self.lock_state()
            .archive
            .record_tls_config(host, cert_der, negotiated_protocol);
    }

    /// Writes the archive to its file. In-memory recordings are discarded if
    /// the process exits without closing.
    pub fn close(&self) -> Result<(), ArchiveError> {
        let mut state = self.lock_state();
        let mut output = state.output.take().ok_or(ArchiveError::AlreadyClosed)?;
        state.archive.serialize(&mut output)?;
        output
            .flush()
            .map_err(|err| ArchiveError::Io(format!("flush archive output: {err}")))?;
        Ok(())
    }

    fn lock_state(&self) -> MutexGuard<'_, WritableState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
