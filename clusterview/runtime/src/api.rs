//! Serves the authorization-scoped views over HTTP.
//!
//! The caller's identity is asserted by an authenticating front proxy through the `X-Remote-User`
//! and `X-Remote-Group` headers. Watches are streamed as newline-delimited JSON events.

use crate::{
    core::{self, Event, UserInfo, CLUSTERVIEW_API_GROUP},
    index::{ClusterSetView, ClusterView, ResourceView, UserPermissionView},
    k8s::Selector,
};
use bytes::Bytes;
use futures::{future, prelude::*};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full, StreamBody};
use hyper::{body::Frame, http, Request, Response};
use serde::{Deserialize, Serialize};
use std::{convert::Infallible, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

pub const USER_HEADER: &str = "x-remote-user";
pub const GROUP_HEADER: &str = "x-remote-group";

pub type Body = UnsyncBoxBody<Bytes, Infallible>;

#[derive(Clone)]
pub struct Api {
    clusters: Arc<ClusterView>,
    cluster_sets: Arc<ClusterSetView>,
    permissions: Arc<UserPermissionView>,
    drain: drain::Watch,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Kind {
    Clusters,
    ClusterSets,
    Permissions,
}

#[derive(Debug, PartialEq, Eq)]
struct Route<'p> {
    kind: Kind,
    name: Option<&'p str>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Params {
    label_selector: Option<String>,
    watch: Option<String>,
    send_initial_events: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct List<'i, T> {
    api_version: String,
    kind: &'static str,
    metadata: serde_json::Map<String, serde_json::Value>,
    items: &'i [T],
}

#[derive(Serialize)]
struct WatchEvent<'o, T> {
    #[serde(rename = "type")]
    type_: &'static str,
    object: WatchObject<'o, T>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum WatchObject<'o, T> {
    Resource(&'o T),
    Status(Status),
}

/// A Kubernetes `Status` describing a failed request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Status {
    api_version: &'static str,
    kind: &'static str,
    status: &'static str,
    message: String,
    reason: &'static str,
    code: u16,
}

// === impl Api ===

impl<B> tower::Service<Request<B>> for Api {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::Ready<Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        trace!(method = %req.method(), uri = %req.uri());
        future::ready(self.handle(req.method(), req.uri(), req.headers()))
    }
}

impl Api {
    pub fn new(
        clusters: Arc<ClusterView>,
        cluster_sets: Arc<ClusterSetView>,
        permissions: Arc<UserPermissionView>,
        drain: drain::Watch,
    ) -> Self {
        Self {
            clusters,
            cluster_sets,
            permissions,
            drain,
        }
    }

    fn handle(
        &self,
        method: &http::Method,
        uri: &http::Uri,
        headers: &http::HeaderMap,
    ) -> Result<Response<Body>, Error> {
        let Some(route) = Route::parse(uri.path()) else {
            return Status::not_found(uri.path()).into_response();
        };
        if method != http::Method::GET {
            return Status::method_not_allowed(method).into_response();
        }
        let Some(user) = caller(headers) else {
            return Status::unauthorized().into_response();
        };
        let params = match uri.query().map(serde_urlencoded::from_str::<Params>) {
            None => Params::default(),
            Some(Ok(params)) => params,
            Some(Err(error)) => return Status::bad_request(error).into_response(),
        };

        match route.kind {
            Kind::Clusters => self.serve(&*self.clusters, route, &user, params),
            Kind::ClusterSets => self.serve(&*self.cluster_sets, route, &user, params),
            Kind::Permissions => self.serve(&*self.permissions, route, &user, params),
        }
    }

    fn serve<V>(
        &self,
        view: &V,
        route: Route<'_>,
        user: &UserInfo,
        params: Params,
    ) -> Result<Response<Body>, Error>
    where
        V: ResourceView,
        V::Object: Serialize + Send + 'static,
    {
        if let Some(name) = route.name {
            return match view.get(user, name) {
                Ok(obj) => json_response(http::StatusCode::OK, &obj),
                Err(error) => Status::from_view(error).into_response(),
            };
        }

        if params.watch.as_deref().is_some_and(is_true) {
            let include_initial = !params.send_initial_events.as_deref().is_some_and(is_false);
            return match view.watch(user, include_initial) {
                Ok(watch) => {
                    debug!(kind = view.kind(), user = %user.name, include_initial, "watching");
                    Ok(stream_response(watch.results(), self.drain.clone()))
                }
                Err(error) => Status::from_view(error).into_response(),
            };
        }

        let selector = match params.label_selector.as_deref().map(str::parse::<Selector>) {
            None => Selector::default(),
            Some(Ok(selector)) => selector,
            Some(Err(error)) => {
                return Status::from_view(core::Error::InvalidSelector(error.to_string()))
                    .into_response()
            }
        };
        match view.list(user, &selector) {
            Ok(items) => json_response(
                http::StatusCode::OK,
                &List {
                    api_version: route.kind.api_version(),
                    kind: route.kind.list_kind(),
                    metadata: Default::default(),
                    items: &items,
                },
            ),
            Err(error) => Status::from_view(error).into_response(),
        }
    }
}

fn caller(headers: &http::HeaderMap) -> Option<UserInfo> {
    let name = headers.get(USER_HEADER)?.to_str().ok()?;
    if name.is_empty() {
        return None;
    }
    let groups = headers
        .get_all(GROUP_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter(|g| !g.is_empty());
    Some(UserInfo::new(name, groups))
}

fn is_true(v: &str) -> bool {
    v == "true" || v == "1"
}

fn is_false(v: &str) -> bool {
    v == "false" || v == "0"
}

fn json_response(status: http::StatusCode, body: &impl Serialize) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(body)?;
    Ok(Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(bytes)).boxed_unsync())
        .expect("json response must be valid"))
}

/// Streams events as newline-delimited JSON until the watch ends or the process shuts down.
fn stream_response<T>(events: core::EventStream<T>, drain: drain::Watch) -> Response<Body>
where
    T: Serialize + Send + 'static,
{
    let frames = events
        .take_until(drain.signaled().map(|_| ()))
        .filter_map(|ev| future::ready(encode_event(&ev)))
        .map(|line| Ok::<_, Infallible>(Frame::data(line)));
    Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .header(http::header::TRANSFER_ENCODING, "chunked")
        .body(StreamBody::new(frames).boxed_unsync())
        .expect("watch response must be valid")
}

fn encode_event<T: Serialize>(ev: &Event<T>) -> Option<Bytes> {
    let object = match ev {
        Event::Added(obj) | Event::Modified(obj) | Event::Deleted(obj) => {
            WatchObject::Resource(obj)
        }
        Event::Error(status) => {
            info!(message = %status.message, "watch terminated");
            WatchObject::Status(Status::expired(&status.message))
        }
    };
    let event = WatchEvent {
        type_: ev.type_name(),
        object,
    };
    match serde_json::to_vec(&event) {
        Ok(mut line) => {
            line.push(b'\n');
            Some(line.into())
        }
        Err(error) => {
            warn!(%error, "failed to encode watch event");
            None
        }
    }
}

// === impl Kind ===

impl Kind {
    fn from_path(version: &str, resource: &str) -> Option<Self> {
        match (version, resource) {
            ("v1", "managedclusters") => Some(Self::Clusters),
            ("v1", "managedclustersets") => Some(Self::ClusterSets),
            ("v1alpha1", "userpermissions") => Some(Self::Permissions),
            _ => None,
        }
    }

    fn api_version(self) -> String {
        let version = match self {
            Self::Clusters | Self::ClusterSets => "v1",
            Self::Permissions => "v1alpha1",
        };
        format!("{CLUSTERVIEW_API_GROUP}/{version}")
    }

    fn list_kind(self) -> &'static str {
        match self {
            Self::Clusters => "ManagedClusterList",
            Self::ClusterSets => "ManagedClusterSetList",
            Self::Permissions => "UserPermissionList",
        }
    }
}

// === impl Route ===

impl<'p> Route<'p> {
    /// Parses `/apis/<group>/<version>/<resource>[/<name>]`.
    fn parse(path: &'p str) -> Option<Self> {
        let rest = path
            .strip_prefix("/apis/")?
            .strip_prefix(CLUSTERVIEW_API_GROUP)?
            .strip_prefix('/')?;
        let mut segments = rest.trim_end_matches('/').split('/');
        let version = segments.next()?;
        let kind = Kind::from_path(version, segments.next()?)?;
        let name = segments.next().filter(|n| !n.is_empty());
        if segments.next().is_some() {
            return None;
        }
        Some(Self { kind, name })
    }
}

// === impl Status ===

impl Status {
    fn failure(code: http::StatusCode, reason: &'static str, message: impl ToString) -> Self {
        Self {
            api_version: "v1",
            kind: "Status",
            status: "Failure",
            message: message.to_string(),
            reason,
            code: code.as_u16(),
        }
    }

    fn from_view(error: core::Error) -> Self {
        match error {
            core::Error::Forbidden { .. } => {
                Self::failure(http::StatusCode::FORBIDDEN, "Forbidden", error)
            }
            core::Error::NotSynced(_) => {
                Self::failure(http::StatusCode::SERVICE_UNAVAILABLE, "ServiceUnavailable", error)
            }
            core::Error::InvalidSelector(_) => {
                Self::failure(http::StatusCode::BAD_REQUEST, "BadRequest", error)
            }
        }
    }

    fn not_found(path: &str) -> Self {
        Self::failure(
            http::StatusCode::NOT_FOUND,
            "NotFound",
            format_args!("the server could not find the requested resource: {path}"),
        )
    }

    fn method_not_allowed(method: &http::Method) -> Self {
        Self::failure(
            http::StatusCode::METHOD_NOT_ALLOWED,
            "MethodNotAllowed",
            format_args!("{method} is not supported"),
        )
    }

    fn unauthorized() -> Self {
        Self::failure(
            http::StatusCode::UNAUTHORIZED,
            "Unauthorized",
            "the request does not carry a caller identity",
        )
    }

    fn bad_request(error: impl ToString) -> Self {
        Self::failure(http::StatusCode::BAD_REQUEST, "BadRequest", error)
    }

    /// Terminates a watch; the caller must start over.
    fn expired(message: &str) -> Self {
        Self::failure(http::StatusCode::GONE, "Expired", message)
    }

    fn into_response(self) -> Result<Response<Body>, Error> {
        let code = http::StatusCode::from_u16(self.code)
            .unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
        json_response(code, &self)
    }
}
