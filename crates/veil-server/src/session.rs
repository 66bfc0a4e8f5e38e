//! Stateless request handling over a [`SenderDb`]
//!
//! Nothing is kept between calls; every handler reads the database it is
//! given and answers on the channel it is given.

use std::time::Instant;

use rayon::prelude::*;
use veil_core::wire::{OprfRequest, OprfResponse, ParamsResponse, QueryRequest, QueryResponse, ResultPart};
use veil_core::{BufferChannel, Channel, Error, HeBackend, Message, OperationKind, Request, Result};

use crate::db::SenderDb;
use crate::metrics;

/// Answer a parameters request
pub fn params_response(db: &SenderDb) -> Result<ParamsResponse> {
    Ok(ParamsResponse {
        params_json: db.params().to_json()?,
    })
}

/// Evaluate the OPRF over blinded points
pub fn oprf_response(db: &SenderDb, request: &OprfRequest) -> Result<OprfResponse> {
    let evaluated = db.oprf_key().evaluate(&request.blinded)?;
    tracing::debug!(items = evaluated.len(), "OPRF evaluated");
    Ok(OprfResponse { evaluated })
}

/// Run an encrypted query against every bin bundle
pub fn query_response<B: HeBackend>(
    db: &SenderDb,
    request: &QueryRequest,
    pool: &rayon::ThreadPool,
) -> Result<(QueryResponse, Vec<ResultPart>)> {
    let expected = db.params().fingerprint();
    if request.params_fingerprint != expected {
        return Err(Error::ParameterMismatch {
            request: request.params_fingerprint,
            database: expected,
        });
    }

    let layout = db.slot_layout();
    if request.bundles.len() != layout.bundle_idx_count {
        return Err(Error::MalformedMessage(format!(
            "query carries {} bundles, parameters define {}",
            request.bundles.len(),
            layout.bundle_idx_count
        )));
    }

    let backend = B::from_params(db.params())?;
    let context_id = backend.context().id;
    let plane_count = db.label_plane_count();

    let work: Vec<_> = (0..layout.bundle_idx_count)
        .flat_map(|idx| db.bundles_for(idx).iter().map(move |bundle| (idx, bundle)))
        .collect();

    let parts = pool.install(|| {
        work.par_iter()
            .map(|(idx, bundle)| {
                let result = backend.evaluate_bundle(&request.bundles[*idx], bundle.bins(), plane_count)?;
                Ok(ResultPart {
                    context_id,
                    bundle_idx: *idx as u32,
                    label_byte_count: db.label_byte_count() as u32,
                    nonce_byte_count: db.nonce_byte_count() as u32,
                    matches: result.matches,
                    label_planes: result.label_planes,
                })
            })
            .collect::<Result<Vec<_>>>()
    })?;

    tracing::debug!(parts = parts.len(), "query evaluated");
    let response = QueryResponse {
        context_id,
        package_count: parts.len() as u32,
    };
    Ok((response, parts))
}

/// Receive a parameters request and answer it
pub fn handle_params<C: Channel>(db: &SenderDb, channel: &mut C) -> Result<()> {
    channel.receive_operation(None, Some(OperationKind::Params))?;
    channel.send(&Message::ParamsResponse(params_response(db)?))
}

/// Receive an OPRF request and answer it
pub fn handle_oprf<C: Channel>(db: &SenderDb, channel: &mut C) -> Result<()> {
    match channel.receive_operation(None, Some(OperationKind::Oprf))? {
        Request::Oprf(request) => channel.send(&Message::OprfResponse(oprf_response(db, &request)?)),
        other => Err(Error::InvalidOperationKind {
            expected: OperationKind::Oprf,
            received: other.operation(),
        }),
    }
}

/// Receive a query and stream back the response and its result parts
pub fn handle_query<B: HeBackend, C: Channel>(
    db: &SenderDb,
    channel: &mut C,
    pool: &rayon::ThreadPool,
) -> Result<()> {
    match channel.receive_operation(Some(db.crypto_context()), Some(OperationKind::Query))? {
        Request::Query(request) => send_query_results::<B, C>(db, &request, channel, pool),
        other => Err(Error::InvalidOperationKind {
            expected: OperationKind::Query,
            received: other.operation(),
        }),
    }
}

fn send_query_results<B: HeBackend, C: Channel>(
    db: &SenderDb,
    request: &QueryRequest,
    channel: &mut C,
    pool: &rayon::ThreadPool,
) -> Result<()> {
    let (response, parts) = query_response::<B>(db, request, pool)?;
    metrics::record_result_parts(parts.len());
    channel.send(&Message::QueryResponse(response))?;
    for part in parts {
        channel.send(&Message::ResultPart(part))?;
    }
    Ok(())
}

/// Receive any request and answer it
///
/// Returns the operation that was served.
pub fn handle_request<B: HeBackend, C: Channel>(
    db: &SenderDb,
    channel: &mut C,
    pool: &rayon::ThreadPool,
) -> Result<OperationKind> {
    let request = channel.receive_operation(Some(db.crypto_context()), None)?;
    let operation = request.operation();
    let start = Instant::now();

    let result = match &request {
        Request::Params(_) => params_response(db).and_then(|r| channel.send(&Message::ParamsResponse(r))),
        Request::Oprf(r) => oprf_response(db, r).and_then(|r| channel.send(&Message::OprfResponse(r))),
        Request::Query(r) => send_query_results::<B, C>(db, r, channel, pool),
    };

    let outcome = match &result {
        Ok(()) => metrics::OUTCOME_OK,
        Err(e) => metrics::outcome_for(e),
    };
    metrics::record_request(operation, outcome, start.elapsed());
    tracing::debug!(%operation, outcome, elapsed_ms = start.elapsed().as_millis() as u64, "request handled");

    result.map(|_| operation)
}

/// Bytes-in/bytes-out OPRF handling
pub fn handle_oprf_bytes(db: &SenderDb, request: &[u8]) -> Result<Vec<u8>> {
    let mut channel = BufferChannel::new();
    channel.set_input(request.to_vec());
    handle_oprf(db, &mut channel)?;
    Ok(channel.extract_output())
}

/// Bytes-in/bytes-out query handling
///
/// The output holds the query response followed by all result parts.
pub fn handle_query_bytes<B: HeBackend>(
    db: &SenderDb,
    request: &[u8],
    pool: &rayon::ThreadPool,
) -> Result<Vec<u8>> {
    let mut channel = BufferChannel::new();
    channel.set_input(request.to_vec());
    handle_query::<B, _>(db, &mut channel, pool)?;
    Ok(channel.extract_output())
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_core::oprf::OprfReceiver;
    use veil_core::params::test_params;
    use veil_core::wire::{self, MessageKind, ParamsRequest};
    use veil_core::{CryptoContext, Item, Response, ThreadPoolConfig, TransparentBackend};

    fn pool() -> rayon::ThreadPool {
        ThreadPoolConfig::new(2).unwrap().build().unwrap()
    }

    fn db() -> SenderDb {
        let mut db = SenderDb::new(test_params(), 4, 16, false).unwrap();
        db.insert_or_assign_labeled(&Item::from("a"), b"la").unwrap();
        db
    }

    fn empty_query(db: &SenderDb) -> QueryRequest {
        let backend = TransparentBackend::from_params(db.params()).unwrap();
        let zeros = vec![0u64; backend.context().slot_count];
        QueryRequest {
            params_fingerprint: db.params().fingerprint(),
            context_id: backend.context().id,
            bundles: vec![backend.encrypt(&zeros).unwrap()],
        }
    }

    #[test]
    fn test_oprf_bytes() {
        let db = db();
        let (receiver, blinded) = OprfReceiver::blind(&[Item::from("a")]);
        let request = wire::encode(&Message::OprfRequest(OprfRequest { blinded })).unwrap();

        let out = handle_oprf_bytes(&db, &request).unwrap();
        let response = match wire::decode(&out, MessageKind::OprfResponse, None).unwrap() {
            Message::OprfResponse(r) => r,
            other => panic!("unexpected {:?}", other),
        };
        let (hashed, _) = receiver.unblind(&response.evaluated).unwrap();
        assert_eq!(hashed[0], db.oprf_key().compute_hash(&Item::from("a")).0);
    }

    #[test]
    fn test_oprf_rejects_other_operation() {
        let db = db();
        let request = wire::encode(&Message::ParamsRequest(ParamsRequest)).unwrap();
        assert!(matches!(
            handle_oprf_bytes(&db, &request),
            Err(Error::InvalidOperationKind {
                expected: OperationKind::Oprf,
                received: OperationKind::Params
            })
        ));
    }

    #[test]
    fn test_query_parameter_mismatch() {
        let db = db();
        let mut query = empty_query(&db);
        query.params_fingerprint ^= 1;
        assert!(matches!(
            query_response::<TransparentBackend>(&db, &query, &pool()),
            Err(Error::ParameterMismatch { .. })
        ));
    }

    #[test]
    fn test_query_context_mismatch() {
        let db = db();
        let mut query = empty_query(&db);
        query.context_id ^= 1;
        let bytes = wire::encode(&Message::QueryRequest(query)).unwrap();
        assert!(matches!(
            handle_query_bytes::<TransparentBackend>(&db, &bytes, &pool()),
            Err(Error::ContextMismatch { .. })
        ));
    }

    #[test]
    fn test_query_bytes_stream_parts() {
        let db = db();
        let bytes = wire::encode(&Message::QueryRequest(empty_query(&db))).unwrap();
        let out = handle_query_bytes::<TransparentBackend>(&db, &bytes, &pool()).unwrap();

        let mut client = BufferChannel::new();
        client.set_input(out);
        let count = match client.receive_response().unwrap() {
            Response::Query(r) => r.package_count,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(count as usize, db.bundles_for(0).len());

        let context = CryptoContext::from_params(db.params());
        for _ in 0..count {
            let part = client.receive_result(&context).unwrap();
            assert_eq!(part.label_byte_count, 4);
            assert_eq!(part.label_planes.len(), db.label_plane_count());
        }
    }

    #[test]
    fn test_handle_request_routes_params() {
        let db = db();
        let mut channel = BufferChannel::new();
        channel.set_input(wire::encode(&Message::ParamsRequest(ParamsRequest)).unwrap());
        let op = handle_request::<TransparentBackend, _>(&db, &mut channel, &pool()).unwrap();
        assert_eq!(op, OperationKind::Params);

        let out = channel.extract_output();
        channel.set_input(out);
        match channel.receive_response().unwrap() {
            Response::Params(r) => {
                assert_eq!(veil_core::PsiParams::load(&r.params_json).unwrap(), test_params())
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_handle_params_requires_params_request() {
        let db = db();
        let mut channel = BufferChannel::new();
        channel.set_input(wire::encode(&Message::OprfRequest(OprfRequest { blinded: vec![] })).unwrap());
        assert!(matches!(
            handle_params(&db, &mut channel),
            Err(Error::InvalidOperationKind { .. })
        ));
    }
}
