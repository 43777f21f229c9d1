//! Transport-neutral request dispatch.
//!
//! Requests and responses are plain serde types so any transport can carry them. Fragment
//! pixels travel as paths to bitmap files: `update` reads its payload from `payload`, `read`
//! writes its result to `out`.
//!
//! A [`Service`] built with more than one request worker executes requests concurrently, so
//! operations on different canvases overlap while each canvas still runs one operation at a
//! time. Responses are always written in request order. Requests that depend on an earlier one
//! (an `update` of a canvas being created) must wait for that request's response first.

use std::{
    collections::BTreeMap,
    io::{BufRead, Write},
    path::PathBuf,
    sync::{Arc, mpsc},
};

use anyhow::Context as _;

use crate::{
    copier::build_thread_pool,
    foundation::{
        error::{ErrorKind, StoreError, StoreResult},
        geom::CanvasId,
    },
    store::registry::Registry,
};

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum Request {
    Create {
        width: i64,
        height: i64,
    },
    Update {
        id: i64,
        x: i64,
        y: i64,
        width: i64,
        height: i64,
        payload: PathBuf,
    },
    Read {
        id: i64,
        x: i64,
        y: i64,
        width: i64,
        height: i64,
        out: PathBuf,
    },
    Delete {
        id: i64,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Response {
    // Listed first: untagged deserialization must not read an error as a bare `{"ok": ..}`.
    Err {
        ok: bool,
        error: ErrorKind,
        message: String,
    },
    Ok {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<CanvasId>,
    },
}

impl Request {
    /// Canvas id named by the request, if any.
    pub fn canvas_id(&self) -> Option<i64> {
        match self {
            Self::Create { .. } => None,
            Self::Update { id, .. } | Self::Read { id, .. } | Self::Delete { id } => Some(*id),
        }
    }
}

impl Response {
    pub fn success(id: Option<CanvasId>) -> Self {
        Self::Ok { ok: true, id }
    }

    pub fn failure(err: &StoreError) -> Self {
        Self::error(err.kind(), err.to_string())
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Err {
            ok: false,
            error: kind,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// Cheap-to-clone handle that executes [`Request`]s against a shared [`Registry`].
#[derive(Clone, Debug)]
pub struct Service {
    registry: Arc<Registry>,
    workers: Option<Arc<rayon::ThreadPool>>,
}

impl Service {
    /// A service that executes requests one at a time, in arrival order.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            workers: None,
        }
    }

    /// A service that executes up to `workers` requests at once.
    pub fn with_request_workers(registry: Arc<Registry>, workers: usize) -> StoreResult<Self> {
        if workers == 0 {
            return Err(StoreError::parameter("request workers must be >= 1"));
        }
        let workers = if workers == 1 {
            None
        } else {
            Some(Arc::new(build_thread_pool("request", Some(workers))?))
        };
        Ok(Self { registry, workers })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn handle(&self, req: &Request) -> Response {
        if let Some(raw) = req.canvas_id()
            && raw < 0
        {
            return Response::error(ErrorKind::NotFound, format!("canvas {raw} not found"));
        }
        match self.dispatch(req) {
            Ok(id) => Response::success(id),
            Err(err) => {
                tracing::debug!(?req, %err, "request failed");
                Response::failure(&err)
            }
        }
    }

    fn dispatch(&self, req: &Request) -> StoreResult<Option<CanvasId>> {
        match req {
            Request::Create { width, height } => self.registry.create(*width, *height).map(Some),
            Request::Update {
                id,
                x,
                y,
                width,
                height,
                payload,
            } => {
                let id = canvas_id(*id)?;
                let bytes = std::fs::read(payload)
                    .with_context(|| format!("read payload '{}'", payload.display()))
                    .map_err(|e| StoreError::parameter(format!("{e:#}")))?;
                self.registry
                    .update_fragment(id, *x, *y, *width, *height, &bytes)?;
                Ok(None)
            }
            Request::Read {
                id,
                x,
                y,
                width,
                height,
                out,
            } => {
                let id = canvas_id(*id)?;
                let bytes = self.registry.read_fragment(id, *x, *y, *width, *height)?;
                std::fs::write(out, bytes)
                    .with_context(|| format!("write fragment to '{}'", out.display()))?;
                Ok(None)
            }
            Request::Delete { id } => {
                self.registry.delete(canvas_id(*id)?)?;
                Ok(None)
            }
        }
    }

    fn respond(&self, line: &str) -> Response {
        match serde_json::from_str::<Request>(line) {
            Ok(req) => self.handle(&req),
            Err(e) => Response::failure(&StoreError::parameter(format!("bad request: {e}"))),
        }
    }

    /// Serve newline-delimited JSON requests until `input` is exhausted.
    ///
    /// Each non-blank line gets exactly one response line, in request order. Unparseable lines
    /// are answered with a `parameter` error and do not end the session.
    pub fn serve_lines<R: BufRead, W: Write + Send>(&self, input: R, output: W) -> anyhow::Result<()> {
        match &self.workers {
            None => self.serve_sequential(input, output),
            Some(pool) => self.serve_concurrent(pool, input, output),
        }
    }

    fn serve_sequential<R: BufRead, W: Write>(&self, input: R, mut output: W) -> anyhow::Result<()> {
        for line in input.lines() {
            let line = line.context("read request line")?;
            if line.trim().is_empty() {
                continue;
            }
            write_response(&mut output, &self.respond(&line))?;
        }
        Ok(())
    }

    // Lines are read on the calling thread and executed on the request pool. A writer thread
    // buffers out-of-order completions and emits them by sequence number.
    fn serve_concurrent<R: BufRead, W: Write + Send>(
        &self,
        pool: &rayon::ThreadPool,
        input: R,
        output: W,
    ) -> anyhow::Result<()> {
        let (tx, rx) = mpsc::channel::<(u64, Response)>();
        std::thread::scope(|s| {
            let writer = s.spawn(move || write_in_order(rx, output));

            let read = pool.in_place_scope(|scope| -> anyhow::Result<()> {
                let mut seq = 0u64;
                for line in input.lines() {
                    let line = line.context("read request line")?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    let tx = tx.clone();
                    let n = seq;
                    seq += 1;
                    scope.spawn(move |_| {
                        // The writer only hangs up after failing; its error is reported below.
                        let _ = tx.send((n, self.respond(&line)));
                    });
                }
                Ok(())
            });
            drop(tx);

            let written = writer
                .join()
                .map_err(|_| anyhow::anyhow!("response writer panicked"))?;
            read.and(written)
        })
    }
}

fn write_in_order<W: Write>(rx: mpsc::Receiver<(u64, Response)>, mut output: W) -> anyhow::Result<()> {
    let mut next = 0u64;
    let mut ready = BTreeMap::new();
    for (seq, resp) in rx {
        ready.insert(seq, resp);
        while let Some(resp) = ready.remove(&next) {
            write_response(&mut output, &resp)?;
            next += 1;
        }
    }
    Ok(())
}

fn write_response<W: Write>(output: &mut W, resp: &Response) -> anyhow::Result<()> {
    serde_json::to_writer(&mut *output, resp).context("encode response")?;
    output.write_all(b"\n").context("write response")?;
    output.flush().context("flush response")?;
    Ok(())
}

// Negative ids are answered in `Service::handle` before dispatch.
fn canvas_id(raw: i64) -> StoreResult<CanvasId> {
    u64::try_from(raw)
        .map(CanvasId)
        .map_err(|_| StoreError::parameter(format!("canvas id {raw} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "chartographer_{name}_{}_{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ))
    }

    #[test]
    fn requests_parse_from_tagged_json() {
        let req: Request = serde_json::from_str(r#"{"op":"create","width":4,"height":5}"#).unwrap();
        assert_eq!(
            req,
            Request::Create {
                width: 4,
                height: 5
            }
        );
        assert_eq!(req.canvas_id(), None);

        let req: Request = serde_json::from_str(
            r#"{"op":"read","id":0,"x":-2,"y":3,"width":4,"height":4,"out":"o.bmp"}"#,
        )
        .unwrap();
        assert!(matches!(req, Request::Read { x: -2, .. }));
        assert_eq!(req.canvas_id(), Some(0));

        assert!(serde_json::from_str::<Request>(r#"{"op":"resize","id":0}"#).is_err());
    }

    #[test]
    fn responses_serialize_compactly() {
        assert_eq!(
            serde_json::to_string(&Response::success(Some(CanvasId(3)))).unwrap(),
            r#"{"ok":true,"id":3}"#
        );
        assert_eq!(
            serde_json::to_string(&Response::success(None)).unwrap(),
            r#"{"ok":true}"#
        );
        let err = Response::failure(&StoreError::NotFound(CanvasId(9)));
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            r#"{"ok":false,"error":"not_found","message":"canvas 9 not found"}"#
        );
        assert!(!err.is_ok());
    }

    #[test]
    fn negative_ids_are_not_found_with_their_own_value() {
        let root = temp_root("protocol_negative_id");
        let service = Service::new(Arc::new(
            Registry::open(crate::StoreConfig::with_root(&root)).unwrap(),
        ));

        let resp = service.handle(&Request::Delete { id: -1 });
        assert_eq!(
            resp,
            Response::error(ErrorKind::NotFound, "canvas -1 not found")
        );

        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn zero_request_workers_are_rejected() {
        let root = temp_root("protocol_zero_workers");
        let registry = Arc::new(Registry::open(crate::StoreConfig::with_root(&root)).unwrap());
        assert!(matches!(
            Service::with_request_workers(registry.clone(), 0),
            Err(StoreError::Parameter(_))
        ));
        assert!(Service::with_request_workers(registry, 1).unwrap().workers.is_none());

        std::fs::remove_dir_all(&root).ok();
    }
}
