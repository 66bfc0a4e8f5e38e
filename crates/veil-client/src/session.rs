//! Client protocol state machine
//!
//! A session walks through the four protocol phases once:
//!
//! ```text
//! Idle -> ParamsReceived -> OprfPending -> OprfComplete -> QueryBuilt -> ResultExtracted
//! ```
//!
//! Each phase has a send half and a receive half so that requests can be
//! written to a [`BufferChannel`](veil_core::BufferChannel), stored, and
//! answered later. Calling an operation out of order fails with
//! `InvalidState` and leaves the session untouched, as do `EmptyQuery` and
//! an oversized item list in `send_oprf_request`. Any other failure in a
//! protocol phase aborts the session; [`ClientSession::reset`] starts over
//! from the parameters.

use std::collections::HashSet;

use veil_core::label::{decrypt_label, label_blob_len, MAX_NONCE_BYTE_COUNT};
use veil_core::layout::felts_to_bytes;
use veil_core::wire::{OprfRequest, ParamsRequest, QueryRequest, ResultPart};
use veil_core::{
    Channel, CryptoContext, Error, HashedItem, HeBackend, IndexTranslationTable, Item, LabelKey,
    MatchRecord, Message, MessageKind, OprfReceiver, PsiParams, Response, Result, SlotLayout,
    TransparentBackend,
};

use crate::cuckoo::CuckooTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    ParamsReceived,
    OprfPending,
    OprfComplete,
    QueryBuilt,
    ResultExtracted,
    Aborted,
}

impl SessionState {
    pub fn name(self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::ParamsReceived => "ParamsReceived",
            SessionState::OprfPending => "OprfPending",
            SessionState::OprfComplete => "OprfComplete",
            SessionState::QueryBuilt => "QueryBuilt",
            SessionState::ResultExtracted => "ResultExtracted",
            SessionState::Aborted => "Aborted",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything derived from the parameters document
struct Setup<B> {
    params: PsiParams,
    layout: SlotLayout,
    backend: B,
}

pub struct ClientSession<B: HeBackend = TransparentBackend> {
    state: SessionState,
    setup: Option<Setup<B>>,
    receiver: Option<OprfReceiver>,
    hashed_items: Vec<HashedItem>,
    label_keys: Vec<LabelKey>,
    itt: Option<IndexTranslationTable>,
}

fn check_state(operation: &'static str, expected: SessionState, actual: SessionState) -> Result<()> {
    if expected != actual {
        return Err(Error::InvalidState {
            operation,
            expected: expected.name(),
            actual: actual.name(),
        });
    }
    Ok(())
}

impl<B: HeBackend> Default for ClientSession<B> {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            setup: None,
            receiver: None,
            hashed_items: Vec::new(),
            label_keys: Vec::new(),
            itt: None,
        }
    }
}

impl<B: HeBackend> ClientSession<B> {
    /// Session that still needs to fetch parameters
    pub fn new() -> Self {
        Self::default()
    }

    /// Session with parameters known out of band
    pub fn with_params(params: PsiParams) -> Result<Self> {
        let mut session = Self::new();
        session.install_params(params)?;
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn params(&self) -> Option<&PsiParams> {
        self.setup.as_ref().map(|s| &s.params)
    }

    pub fn crypto_context(&self) -> Option<&CryptoContext> {
        self.setup.as_ref().map(|s| s.backend.context())
    }

    /// Number of items in the current query
    pub fn item_count(&self) -> usize {
        self.hashed_items.len()
    }

    /// Drop all per-query state and return to `ParamsReceived`
    pub fn reset(&mut self) -> Result<()> {
        if self.setup.is_none() {
            return Err(Error::InvalidState {
                operation: "reset",
                expected: "a session with parameters",
                actual: self.state.name(),
            });
        }
        self.clear_query();
        self.state = SessionState::ParamsReceived;
        Ok(())
    }

    pub fn send_params_request<C: Channel>(&mut self, channel: &mut C) -> Result<()> {
        check_state("send_params_request", SessionState::Idle, self.state)?;
        channel.send(&Message::ParamsRequest(ParamsRequest))
    }

    pub fn receive_params<C: Channel>(&mut self, channel: &mut C) -> Result<()> {
        check_state("receive_params", SessionState::Idle, self.state)?;
        let result = match channel.receive_response() {
            Ok(Response::Params(response)) => {
                PsiParams::load(&response.params_json).and_then(|p| self.install_params(p))
            }
            Ok(other) => Err(unexpected_response(MessageKind::ParamsResponse, &other)),
            Err(e) => Err(e),
        };
        self.abort_on_error(result)
    }

    /// Fetch parameters over `channel`
    pub fn request_params<C: Channel>(&mut self, channel: &mut C) -> Result<()> {
        self.send_params_request(channel)?;
        self.receive_params(channel)
    }

    /// Blind `items` and send the OPRF request
    ///
    /// Fails with `EmptyQuery` before touching the channel when `items` is
    /// empty, and with `QueryTooLarge` when there are more distinct items
    /// than table bins.
    pub fn send_oprf_request<C: Channel>(&mut self, items: &[Item], channel: &mut C) -> Result<()> {
        check_state("send_oprf_request", SessionState::ParamsReceived, self.state)?;
        if items.is_empty() {
            return Err(Error::EmptyQuery);
        }
        let table_size = self.setup()?.layout.table_size;
        let distinct = items.iter().collect::<HashSet<_>>().len();
        if distinct > table_size as usize {
            return Err(Error::QueryTooLarge {
                unplaced: distinct - table_size as usize,
                table_size,
            });
        }

        let (receiver, blinded) = OprfReceiver::blind(items);
        let result = channel.send(&Message::OprfRequest(OprfRequest { blinded }));
        self.abort_on_error(result)?;

        tracing::debug!(items = items.len(), "OPRF request sent");
        self.receiver = Some(receiver);
        self.state = SessionState::OprfPending;
        Ok(())
    }

    pub fn receive_oprf_response<C: Channel>(&mut self, channel: &mut C) -> Result<()> {
        check_state("receive_oprf_response", SessionState::OprfPending, self.state)?;

        let result = match channel.receive_response() {
            Ok(Response::Oprf(response)) => match self.receiver.take() {
                Some(receiver) => receiver.unblind(&response.evaluated),
                None => Err(Error::InvalidState {
                    operation: "receive_oprf_response",
                    expected: "pending blind state",
                    actual: self.state.name(),
                }),
            },
            Ok(other) => Err(unexpected_response(MessageKind::OprfResponse, &other)),
            Err(e) => Err(e),
        };
        let (hashed_items, label_keys) = self.abort_on_error(result)?;

        self.hashed_items = hashed_items;
        self.label_keys = label_keys;
        self.state = SessionState::OprfComplete;
        Ok(())
    }

    /// Run the OPRF phase over `channel`
    pub fn request_oprf<C: Channel>(&mut self, items: &[Item], channel: &mut C) -> Result<()> {
        self.send_oprf_request(items, channel)?;
        self.receive_oprf_response(channel)
    }

    /// Build the encrypted query and send it
    ///
    /// The index translation table built alongside is kept for result
    /// extraction; a session builds at most one query per OPRF phase.
    pub fn send_query<C: Channel>(&mut self, channel: &mut C) -> Result<()> {
        check_state("send_query", SessionState::OprfComplete, self.state)?;

        let result = self
            .build_query()
            .and_then(|(request, itt)| channel.send(&Message::QueryRequest(request)).map(|_| itt));
        let itt = self.abort_on_error(result)?;

        self.itt = Some(itt);
        self.state = SessionState::QueryBuilt;
        Ok(())
    }

    /// Receive the query response and all its result parts, then extract
    pub fn receive_results<C: Channel>(&mut self, channel: &mut C) -> Result<Vec<MatchRecord>> {
        check_state("receive_results", SessionState::QueryBuilt, self.state)?;
        let parts = self.receive_parts(channel);
        let parts = self.abort_on_error(parts)?;
        self.process_result_parts(parts)
    }

    /// Send the query and extract its results
    pub fn request_query<C: Channel>(&mut self, channel: &mut C) -> Result<Vec<MatchRecord>> {
        self.send_query(channel)?;
        self.receive_results(channel)
    }

    /// Merge result parts into one record per input item, in input order
    ///
    /// Parts may come in any order. No parts means no matches.
    pub fn process_result_parts(&mut self, parts: Vec<ResultPart>) -> Result<Vec<MatchRecord>> {
        check_state("process_result_parts", SessionState::QueryBuilt, self.state)?;
        let Some(itt) = self.itt.take() else {
            return Err(Error::InvalidState {
                operation: "process_result_parts",
                expected: "an index translation table",
                actual: self.state.name(),
            });
        };

        let result = self.extract(itt, &parts);
        let records = self.abort_on_error(result)?;

        let found = records.iter().filter(|r| r.found).count();
        tracing::info!(items = records.len(), found, parts = parts.len(), "query results extracted");
        self.receiver = None;
        self.hashed_items.clear();
        self.label_keys.clear();
        self.state = SessionState::ResultExtracted;
        Ok(records)
    }

    fn install_params(&mut self, params: PsiParams) -> Result<()> {
        params.validate()?;
        let backend = B::from_params(&params)?;
        let layout = SlotLayout::new(&params);
        tracing::debug!(
            table_size = layout.table_size,
            bundles = layout.bundle_idx_count,
            fingerprint = %format!("{:016x}", params.fingerprint()),
            "parameters installed"
        );
        self.setup = Some(Setup {
            params,
            layout,
            backend,
        });
        self.state = SessionState::ParamsReceived;
        Ok(())
    }

    fn setup(&self) -> Result<&Setup<B>> {
        self.setup.as_ref().ok_or(Error::InvalidState {
            operation: "query",
            expected: "a session with parameters",
            actual: self.state.name(),
        })
    }

    fn build_query(&self) -> Result<(QueryRequest, IndexTranslationTable)> {
        let setup = self.setup()?;
        let layout = &setup.layout;

        let table = CuckooTable::build(layout, &self.hashed_items);
        tracing::debug!(
            items = self.hashed_items.len(),
            fill_rate = table.fill_rate(),
            "cuckoo table built"
        );

        let mut bundles = vec![vec![0u64; layout.slot_count]; layout.bundle_idx_count];
        for (bin, item) in table.occupied() {
            let (bundle_idx, bin_in_bundle) = layout.bundle_of(bin);
            let slots = bundles.get_mut(bundle_idx).ok_or_else(|| {
                Error::InvalidParams(format!("bin {} falls outside the query bundles", bin))
            })?;
            slots[layout.slot_range(bin_in_bundle)].copy_from_slice(&layout.item_felts(item));
        }

        let request = QueryRequest {
            params_fingerprint: setup.params.fingerprint(),
            context_id: setup.backend.context().id,
            bundles: bundles
                .iter()
                .map(|slots| setup.backend.encrypt(slots))
                .collect::<Result<_>>()?,
        };
        let itt = table.into_itt();
        let unplaced = itt.unmapped_items().len();
        if unplaced > 0 {
            return Err(Error::QueryTooLarge {
                unplaced,
                table_size: layout.table_size,
            });
        }
        Ok((request, itt))
    }

    fn receive_parts<C: Channel>(&self, channel: &mut C) -> Result<Vec<ResultPart>> {
        let context = self.setup()?.backend.context();
        let response = match channel.receive_response()? {
            Response::Query(response) => response,
            other => return Err(unexpected_response(MessageKind::QueryResponse, &other)),
        };
        if response.context_id != context.id {
            return Err(Error::ContextMismatch {
                kind: MessageKind::QueryResponse,
                expected: context.id,
                actual: response.context_id,
            });
        }

        (0..response.package_count)
            .map(|_| channel.receive_result(context))
            .collect()
    }

    fn extract(&self, itt: IndexTranslationTable, parts: &[ResultPart]) -> Result<Vec<MatchRecord>> {
        let setup = self.setup()?;
        let layout = &setup.layout;
        let context = setup.backend.context();
        let mut records = vec![MatchRecord::not_found(); itt.item_count()];

        for part in parts {
            if part.context_id != context.id {
                return Err(Error::ContextMismatch {
                    kind: MessageKind::ResultPart,
                    expected: context.id,
                    actual: part.context_id,
                });
            }

            let bundle_idx = part.bundle_idx as usize;
            if bundle_idx >= layout.bundle_idx_count {
                return Err(Error::MalformedMessage(format!(
                    "result part for bundle {} of {}",
                    bundle_idx, layout.bundle_idx_count
                )));
            }

            let label_byte_count = part.label_byte_count as usize;
            let nonce_byte_count = part.nonce_byte_count as usize;
            if nonce_byte_count > MAX_NONCE_BYTE_COUNT {
                return Err(Error::MalformedMessage(format!(
                    "result part nonce of {} bytes exceeds {}",
                    nonce_byte_count, MAX_NONCE_BYTE_COUNT
                )));
            }
            let blob_len = if label_byte_count == 0 {
                0
            } else {
                label_blob_len(label_byte_count, nonce_byte_count)
            };
            let plane_count = layout.label_plane_count(blob_len);
            if part.label_planes.len() != plane_count {
                return Err(Error::MalformedMessage(format!(
                    "result part carries {} label planes, expected {}",
                    part.label_planes.len(),
                    plane_count
                )));
            }

            let matches = setup.backend.decrypt(&part.matches)?;
            let planes = part
                .label_planes
                .iter()
                .map(|plane| setup.backend.decrypt(plane))
                .collect::<Result<Vec<_>>>()?;

            for (bin, indices) in itt.bins() {
                let (bin_bundle, bin_in_bundle) = layout.bundle_of(bin);
                if bin_bundle != bundle_idx {
                    continue;
                }
                let range = layout.slot_range(bin_in_bundle);
                if !matches[range.clone()].iter().all(|&s| s == 0) {
                    continue;
                }

                if blob_len == 0 {
                    for &idx in indices {
                        records[idx] = MatchRecord::found(None);
                    }
                    continue;
                }

                let felts: Vec<u64> = planes
                    .iter()
                    .flat_map(|plane| plane[range.clone()].iter().copied())
                    .collect();
                let blob = felts_to_bytes(&felts, blob_len, layout.bits_per_felt);
                for &idx in indices {
                    let key = self.label_keys.get(idx).ok_or_else(|| {
                        Error::MalformedMessage(format!("no label key for item {}", idx))
                    })?;
                    let label = decrypt_label(&blob, key, label_byte_count, nonce_byte_count)?;
                    records[idx] = MatchRecord::found(Some(label));
                }
            }
        }

        Ok(records)
    }

    fn clear_query(&mut self) {
        self.receiver = None;
        self.hashed_items.clear();
        self.label_keys.clear();
        self.itt = None;
    }

    fn abort_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            tracing::warn!(state = %self.state, error = %e, "session aborted");
            self.clear_query();
            self.state = SessionState::Aborted;
        }
        result
    }
}

fn unexpected_response(expected: MessageKind, received: &Response) -> Error {
    let kind = match received {
        Response::Params(_) => MessageKind::ParamsResponse,
        Response::Oprf(_) => MessageKind::OprfResponse,
        Response::Query(_) => MessageKind::QueryResponse,
    };
    Error::MalformedMessage(format!("expected {}, got {}", expected, kind))
}
