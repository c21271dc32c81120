//! Ordered middleware composition.
//!
//! A [`Handler`] is a cloneable, shareable request handler. A [`Middleware`] turns one
//! handler into another. A [`Chain`] is an immutable list of middleware: the first entry
//! becomes the outermost wrapper, so it sees the request first and the response last.
//!
//! Chains are built once at startup and then only read, so the same base chain can be
//! extended into several route pipelines without any of them observing the others.

use std::{
    convert::Infallible,
    fmt,
    future::Future,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{
    extract::Request,
    handler::Handler as AxumHandler,
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use tower::{Layer, Service, ServiceExt};

type HandlerFn = dyn Fn(Request) -> BoxFuture<'static, Response> + Send + Sync;

/// A terminal or wrapped request handler.
#[derive(Clone)]
pub struct Handler {
    inner: Arc<HandlerFn>,
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler").finish_non_exhaustive()
    }
}

impl Handler {
    pub fn from_fn<F, Fut, R>(f: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoResponse,
    {
        let inner: Arc<HandlerFn> = Arc::new(move |req| {
            let fut = f(req);
            Box::pin(async move { fut.await.into_response() })
        });
        Self { inner }
    }

    /// Adapts any infallible tower service.
    pub fn from_service<S>(service: S) -> Self
    where
        S: Service<Request, Error = Infallible> + Clone + Send + Sync + 'static,
        S::Response: IntoResponse,
        S::Future: Send + 'static,
    {
        Self::from_fn(move |req| {
            let service = service.clone();
            async move {
                match service.oneshot(req).await {
                    Ok(res) => res.into_response(),
                    Err(never) => match never {},
                }
            }
        })
    }

    /// Adapts an axum handler so it can use extractors.
    pub fn from_handler<H, T, S>(handler: H, state: S) -> Self
    where
        H: AxumHandler<T, S>,
        T: 'static,
        S: Clone + Send + Sync + 'static,
    {
        Self::from_service(handler.with_state(state))
    }

    pub async fn call(&self, req: Request) -> Response {
        (self.inner)(req).await
    }
}

impl Service<Request> for Handler {
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let fut = (self.inner)(req);
        Box::pin(async move { Ok(fut.await) })
    }
}

/// A function from handler to handler.
#[derive(Clone)]
pub struct Middleware {
    name: &'static str,
    wrap: Arc<dyn Fn(Handler) -> Handler + Send + Sync>,
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Middleware").field(&self.name).finish()
    }
}

impl Middleware {
    pub fn new<F>(name: &'static str, wrap: F) -> Self
    where
        F: Fn(Handler) -> Handler + Send + Sync + 'static,
    {
        Self { name, wrap: Arc::new(wrap) }
    }

    /// Wraps a tower layer, e.g. `axum::middleware::from_fn_with_state(..)` or a
    /// `tower_http` layer.
    pub fn layer<L>(name: &'static str, layer: L) -> Self
    where
        L: Layer<Handler> + Send + Sync + 'static,
        L::Service: Service<Request, Error = Infallible> + Clone + Send + Sync + 'static,
        <L::Service as Service<Request>>::Response: IntoResponse,
        <L::Service as Service<Request>>::Future: Send + 'static,
    {
        Self::new(name, move |next| Handler::from_service(layer.layer(next)))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn wrap(&self, next: Handler) -> Handler {
        (self.wrap)(next)
    }
}

/// An immutable, ordered sequence of middleware.
#[derive(Clone, Default)]
pub struct Chain {
    middlewares: Arc<[Middleware]>,
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl Chain {
    pub fn new(middlewares: impl IntoIterator<Item = Middleware>) -> Self {
        Self { middlewares: middlewares.into_iter().collect() }
    }

    /// Returns a new chain with `more` after the existing stages. `self` is unchanged.
    pub fn append(&self, more: impl IntoIterator<Item = Middleware>) -> Self {
        Self { middlewares: self.middlewares.iter().cloned().chain(more).collect() }
    }

    /// Wraps `handler` so that the first middleware is outermost.
    pub fn then(&self, handler: Handler) -> Handler {
        self.middlewares.iter().rev().fold(handler, |next, mw| mw.wrap(next))
    }

    pub fn then_fn<F, Fut, R>(&self, f: F) -> Handler
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoResponse,
    {
        self.then(Handler::from_fn(f))
    }

    pub fn then_handler<H, T>(&self, handler: H) -> Handler
    where
        H: AxumHandler<T, ()>,
        T: 'static,
    {
        self.then(Handler::from_handler(handler, ()))
    }

    pub fn then_handler_with_state<H, T, S>(&self, handler: H, state: S) -> Handler
    where
        H: AxumHandler<T, S>,
        T: 'static,
        S: Clone + Send + Sync + 'static,
    {
        self.then(Handler::from_handler(handler, state))
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.middlewares.iter().map(Middleware::name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode};
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(name: &'static str, log: Log) -> Middleware {
        Middleware::new(name, move |next: Handler| {
            let log = log.clone();
            Handler::from_fn(move |req| {
                let next = next.clone();
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(format!("{} in", name));
                    let res = next.call(req).await;
                    log.lock().unwrap().push(format!("{} out", name));
                    res
                }
            })
        })
    }

    fn request() -> Request {
        axum::http::Request::builder().uri("/").body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn first_middleware_is_outermost() {
        let log: Log = Arc::default();
        let chain = Chain::new([
            recorder("A", log.clone()),
            recorder("B", log.clone()),
            recorder("C", log.clone()),
        ]);
        let handler_log = log.clone();
        let handler = chain.then_fn(move |_req| {
            let log = handler_log.clone();
            async move {
                log.lock().unwrap().push("H".to_string());
                StatusCode::OK
            }
        });

        let res = handler.call(request()).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["A in", "B in", "C in", "H", "C out", "B out", "A out"]
        );
    }

    #[tokio::test]
    async fn append_leaves_receiver_untouched() {
        let log: Log = Arc::default();
        let base = Chain::new([recorder("base", log.clone())]);
        let left = base.append([recorder("left", log.clone())]);
        let right = base.append([recorder("right", log.clone())]);

        assert_eq!(base.names(), vec!["base"]);
        assert_eq!(left.names(), vec!["base", "left"]);
        assert_eq!(right.names(), vec!["base", "right"]);

        right.then_fn(|_req| async { StatusCode::OK }).call(request()).await;
        assert_eq!(*log.lock().unwrap(), vec!["base in", "right in", "right out", "base out"]);
    }

    #[tokio::test]
    async fn middleware_can_short_circuit() {
        let gate = Middleware::new("gate", |_next: Handler| {
            Handler::from_fn(|_req| async { StatusCode::FORBIDDEN })
        });
        let reached = Arc::new(Mutex::new(false));
        let flag = reached.clone();
        let handler = Chain::new([gate]).then_fn(move |_req| {
            let flag = flag.clone();
            async move {
                *flag.lock().unwrap() = true;
                StatusCode::OK
            }
        });

        assert_eq!(handler.call(request()).await.status(), StatusCode::FORBIDDEN);
        assert!(!*reached.lock().unwrap());
    }

    #[tokio::test]
    async fn axum_from_fn_layers_compose() {
        async fn tag(req: Request, next: axum::middleware::Next) -> Response {
            let mut res = next.run(req).await;
            res.headers_mut().insert("x-tag", "seen".parse().unwrap());
            res
        }
        let chain = Chain::new([Middleware::layer("tag", axum::middleware::from_fn(tag))]);
        let res = chain.then_handler(|| async { "hello" }).call(request()).await;
        assert_eq!(res.headers()["x-tag"], "seen");
    }

    #[test]
    fn empty_chain_reports_empty() {
        let chain = Chain::default();
        assert!(chain.is_empty());
        assert_eq!(chain.append([]).len(), 0);
    }
}
