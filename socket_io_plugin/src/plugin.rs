use crate::adapter::header_multimap;
use crate::facade::EngineFacade;
use crate::handler::SocketIoHandler;
use crate::router::{drive_session, UpgradeContext};
use bytes::Bytes;
use engine_io::util::{parse_query_string, HttpMethod, RequestContext};
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::HeaderMap;
use warp::hyper::Body;
use warp::path::FullPath;
use warp::ws::{Ws, WebSocket};
use warp::{Filter, Rejection, Reply};

pub const DEFAULT_MOUNT_PATH: &str = "/socket.io/*";

/// Poll bodies larger than this are rejected before buffering.
const REQUEST_BODY_CONTENT_LIMIT: u64 = 1024 * 1024 * 16;

/// Mounts a Socket.IO server on a warp application.
///
/// Construction builds the engines and runs the setup function against the
/// namespace registration surface, synchronously, before any route exists;
/// `filter()` then yields the route tree to serve. Must be constructed
/// within a tokio runtime.
pub struct SocketIoPlugin {
    mount_path: String,
    facade: Arc<EngineFacade>,
}

impl SocketIoPlugin {
    pub fn new(setup: impl FnOnce(&SocketIoHandler)) -> Self {
        Self::with_path(DEFAULT_MOUNT_PATH, setup)
    }

    pub fn with_path(path: &str, setup: impl FnOnce(&SocketIoHandler)) -> Self {
        let facade = Arc::new(EngineFacade::new());
        let handler = SocketIoHandler::new(facade.clone());
        setup(&handler);
        SocketIoPlugin {
            mount_path: normalize_mount_path(path),
            facade,
        }
    }

    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    /// The complete route tree: GET and POST polling routes plus the
    /// websocket upgrade route on the mount path.
    pub fn filter(&self) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
        // "/custompath/*" matches "/custompath" and everything below
        // "/custompath/"
        let base = self.mount_path.trim_end_matches('*').to_owned();
        let facade = self.facade.clone();

        // The order is important: the ws route's filter looks for the
        // upgrade header and must run before the plain GET route.
        let websocket = mounted(base.clone())
            .and(warp::ws())
            .and(warp::header::headers_cloned())
            .and(raw_query())
            .and(with_facade(facade.clone()))
            .map(
                |ws: Ws, headers: HeaderMap, raw_query: String, facade: Arc<EngineFacade>| {
                    ws.on_upgrade(move |websocket: WebSocket| {
                        drive_session(websocket, UpgradeContext { raw_query, headers }, facade)
                    })
                },
            );

        let poll = mounted(base.clone())
            .and(warp::get())
            .and(request_context(HttpMethod::Get))
            .and(with_facade(facade.clone()))
            .and_then(
                |context: RequestContext, facade: Arc<EngineFacade>| async move {
                    let response = facade.handle_request(context, None).await;
                    Ok::<_, Rejection>(response.map(Body::from))
                },
            );

        let data = mounted(base)
            .and(warp::post())
            .and(warp::body::content_length_limit(REQUEST_BODY_CONTENT_LIMIT))
            .and(warp::body::bytes())
            .and(request_context(HttpMethod::Post))
            .and(with_facade(facade))
            .and_then(
                |body: Bytes, context: RequestContext, facade: Arc<EngineFacade>| async move {
                    let response = facade.handle_request(context, Some(body)).await;
                    Ok::<_, Rejection>(response.map(Body::from))
                },
            );

        websocket.or(poll).or(data)
    }
}

/// Normalizes a user-supplied mount path to start with `/` and end with
/// the `/*` wildcard suffix.
pub fn normalize_mount_path(path: &str) -> String {
    let prefix = if path.starts_with('/') { "" } else { "/" };
    let suffix = if path.ends_with("/*") { "" } else { "/*" };
    format!("{}{}{}", prefix, path, suffix)
}

/// Passes requests whose path sits under `base` ("/custompath/"), plus the
/// bare prefix itself.
fn mounted(base: String) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::path::full()
        .and_then(move |path: FullPath| {
            let matched = is_mounted(path.as_str(), &base);
            async move {
                if matched {
                    Ok(())
                } else {
                    Err(warp::reject::not_found())
                }
            }
        })
        .untuple_one()
}

fn is_mounted(path: &str, base: &str) -> bool {
    path.starts_with(base) || path == &base[..base.len() - 1]
}

/// The raw query string, or empty when the request has none.
fn raw_query() -> impl Filter<Extract = (String,), Error = Infallible> + Clone {
    warp::query::raw()
        .or(warp::any().map(String::new))
        .unify()
}

fn request_context(
    http_method: HttpMethod,
) -> impl Filter<Extract = (RequestContext,), Error = Infallible> + Clone {
    warp::header::headers_cloned()
        .and(raw_query())
        .map(move |headers: HeaderMap, raw_query: String| RequestContext {
            query: parse_query_string(&raw_query),
            headers: header_multimap(&headers),
            http_method,
        })
}

fn with_facade(
    facade: Arc<EngineFacade>,
) -> impl Filter<Extract = (Arc<EngineFacade>,), Error = Infallible> + Clone {
    warp::any().map(move || facade.clone())
}
