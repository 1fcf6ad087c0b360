//! Request guard: authentication gating plus per-identity rate limiting,
//! applied as an actix-web middleware around any service.
//!
//! ```text
//! App::new().service(
//!     web::scope("/api")
//!         .wrap(Protect::authenticated(resolver, limiter))
//!         .service(add_transaction),
//! )
//! ```

use std::future::{ready, Ready};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::HeaderValue;
use actix_web::{Error, HttpMessage, ResponseError};
use futures::future::LocalBoxFuture;
use tracing::{debug, error, warn};

use crate::auth::{credentials, Principal, PrincipalResolver};
use crate::error::{ApiError, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING};
use crate::rate_limit::{Identity, RateLimiter};

/// Used when the caller's network address cannot be determined.
const FALLBACK_ADDR: &str = "127.0.0.1";

#[derive(Clone)]
enum Access {
    Authenticated(Arc<dyn PrincipalResolver>),
    Public,
}

/// Middleware factory. Authenticated routes count requests per user,
/// public routes per network address.
#[derive(Clone)]
pub struct Protect {
    access: Access,
    limiter: RateLimiter,
}

impl Protect {
    pub fn authenticated(resolver: Arc<dyn PrincipalResolver>, limiter: RateLimiter) -> Self {
        Self {
            access: Access::Authenticated(resolver),
            limiter,
        }
    }

    pub fn public(limiter: RateLimiter) -> Self {
        Self {
            access: Access::Public,
            limiter,
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for Protect
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = ProtectMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(ProtectMiddleware {
            service: Rc::new(service),
            access: self.access.clone(),
            limiter: self.limiter.clone(),
        }))
    }
}

pub struct ProtectMiddleware<S> {
    service: Rc<S>,
    access: Access,
    limiter: RateLimiter,
}

impl<S, B> Service<ServiceRequest> for ProtectMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let access = self.access.clone();
        let limiter = self.limiter.clone();

        Box::pin(async move {
            let (identity, principal) = match identify(&access, &req).await {
                Ok(identified) => identified,
                Err(rejection) => {
                    return Ok(req
                        .into_response(rejection.error_response())
                        .map_into_right_body())
                }
            };

            let decision = match limiter.check(&identity).await {
                Ok(decision) => decision,
                Err(e) => {
                    // Fail closed: no admission without a counted hit.
                    error!(identity = %identity, error = %e, "Rate limit check failed");
                    return Ok(req
                        .into_response(ApiError::Internal.error_response())
                        .map_into_right_body());
                }
            };

            if !decision.admitted {
                warn!(identity = %identity, limit = decision.limit, "Rate limit exceeded");
                return Ok(req
                    .into_response(ApiError::RateLimited(decision).error_response())
                    .map_into_right_body());
            }

            if let Some(principal) = principal {
                req.extensions_mut().insert(principal);
            }

            let mut res = service.call(req).await?;
            let headers = res.headers_mut();
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));

            Ok(res.map_into_left_body())
        })
    }
}

async fn identify(
    access: &Access,
    req: &ServiceRequest,
) -> Result<(Identity, Option<Principal>), ApiError> {
    match access {
        Access::Authenticated(resolver) => {
            let token = credentials(req.request()).ok_or(ApiError::Unauthorized)?;
            match resolver.resolve(&token).await {
                Ok(principal) => Ok((Identity::User(principal.user_id.clone()), Some(principal))),
                Err(e) if e.is_rejection() => {
                    debug!(error = %e, path = req.path(), "Rejected session");
                    Err(ApiError::Unauthorized)
                }
                Err(e) => {
                    error!(error = %e, "Could not resolve session");
                    Err(ApiError::Internal)
                }
            }
        }
        Access::Public => Ok((Identity::Ip(client_addr(req)), None)),
    }
}

/// The caller's address, honouring `Forwarded` / `X-Forwarded-For`.
fn client_addr(req: &ServiceRequest) -> String {
    let info = req.connection_info();
    match info.realip_remote_addr() {
        // The peer address carries a port; forwarded addresses usually do not.
        Some(addr) => match addr.parse::<SocketAddr>() {
            Ok(socket) => socket.ip().to_string(),
            Err(_) => addr.to_string(),
        },
        None => FALLBACK_ADDR.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::{token_for, SECRET};
    use crate::auth::{AuthError, JwtResolver};
    use crate::rate_limit::{
        CounterHit, CounterStore, MemoryCounterStore, RateLimitError, RateLimitPolicy,
    };
    use actix_web::http::header::{AUTHORIZATION, RETRY_AFTER};
    use actix_web::http::StatusCode;
    use actix_web::{test, web, App, HttpResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Counts hits so tests can tell whether the limiter ran at all.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryCounterStore,
        hits: AtomicUsize,
        keys: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CounterStore for CountingStore {
        async fn hit(&self, key: &str, window: Duration) -> Result<CounterHit, RateLimitError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.keys.lock().unwrap().push(key.to_string());
            self.inner.hit(key, window).await
        }
    }

    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        async fn hit(&self, _key: &str, _window: Duration) -> Result<CounterHit, RateLimitError> {
            Err(RateLimitError::Store("connection refused".to_string()))
        }
    }

    struct BrokenResolver;

    #[async_trait]
    impl PrincipalResolver for BrokenResolver {
        async fn resolve(&self, _token: &str) -> Result<Principal, AuthError> {
            Err(AuthError::Provider("auth service timed out".to_string()))
        }
    }

    fn policy(limit: u32) -> RateLimitPolicy {
        RateLimitPolicy {
            limit,
            window: Duration::from_secs(60),
        }
    }

    fn resolver() -> Arc<dyn PrincipalResolver> {
        Arc::new(JwtResolver::new(SECRET, None))
    }

    async fn whoami(principal: Principal, calls: web::Data<AtomicUsize>) -> HttpResponse {
        calls.fetch_add(1, Ordering::SeqCst);
        HttpResponse::Ok().body(principal.user_id.to_string())
    }

    async fn open(calls: web::Data<AtomicUsize>) -> HttpResponse {
        calls.fetch_add(1, Ordering::SeqCst);
        HttpResponse::Ok().finish()
    }

    #[actix_web::test]
    async fn test_missing_credentials_get_401_before_limiting() {
        let store = Arc::new(CountingStore::default());
        let calls = web::Data::new(AtomicUsize::new(0));
        let limiter = RateLimiter::new(store.clone(), policy(10));
        let app = test::init_service(
            App::new().app_data(calls.clone()).service(
                web::resource("/me")
                    .wrap(Protect::authenticated(resolver(), limiter))
                    .route(web::get().to(whoami)),
            ),
        )
        .await;

        let res = test::call_service(&app, test::TestRequest::get().uri("/me").to_request()).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let bad = test::TestRequest::get()
            .uri("/me")
            .insert_header((AUTHORIZATION, "Bearer forged"))
            .to_request();
        assert_eq!(test::call_service(&app, bad).await.status(), StatusCode::UNAUTHORIZED);

        assert_eq!(store.hits.load(Ordering::SeqCst), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[actix_web::test]
    async fn test_authenticated_request_gets_headers_and_principal() {
        let store = Arc::new(CountingStore::default());
        let calls = web::Data::new(AtomicUsize::new(0));
        let limiter = RateLimiter::new(store.clone(), policy(10));
        let app = test::init_service(
            App::new().app_data(calls.clone()).service(
                web::resource("/me")
                    .wrap(Protect::authenticated(resolver(), limiter))
                    .route(web::get().to(whoami)),
            ),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/me")
            .insert_header((AUTHORIZATION, format!("Bearer {}", token_for("user-7"))))
            .to_request();
        let res = test::call_service(&app, req).await;

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers().get(X_RATELIMIT_LIMIT).unwrap(), "10");
        assert_eq!(res.headers().get(X_RATELIMIT_REMAINING).unwrap(), "9");
        assert_eq!(test::read_body(res).await, "user-7");
        assert_eq!(
            store.keys.lock().unwrap().as_slice(),
            ["rate_limit:user:user-7".to_string()]
        );
    }

    #[actix_web::test]
    async fn test_request_over_limit_gets_429() {
        let calls = web::Data::new(AtomicUsize::new(0));
        let limiter = RateLimiter::new(Arc::new(MemoryCounterStore::new()), policy(2));
        let app = test::init_service(
            App::new().app_data(calls.clone()).service(
                web::resource("/me")
                    .wrap(Protect::authenticated(resolver(), limiter))
                    .route(web::get().to(whoami)),
            ),
        )
        .await;
        let token = token_for("user-1");
        let request = || {
            test::TestRequest::get()
                .uri("/me")
                .insert_header((AUTHORIZATION, format!("Bearer {token}")))
                .to_request()
        };

        assert_eq!(test::call_service(&app, request()).await.status(), StatusCode::OK);
        assert_eq!(test::call_service(&app, request()).await.status(), StatusCode::OK);

        let res = test::call_service(&app, request()).await;
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(res.headers().get(X_RATELIMIT_REMAINING).unwrap(), "0");
        assert!(res.headers().contains_key(RETRY_AFTER));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Another user has their own window.
        let other = test::TestRequest::get()
            .uri("/me")
            .insert_header((AUTHORIZATION, format!("Bearer {}", token_for("user-2"))))
            .to_request();
        assert_eq!(test::call_service(&app, other).await.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_counter_store_failure_fails_closed() {
        let calls = web::Data::new(AtomicUsize::new(0));
        let limiter = RateLimiter::new(Arc::new(DownStore), policy(10));
        let app = test::init_service(
            App::new().app_data(calls.clone()).service(
                web::resource("/open")
                    .wrap(Protect::public(limiter))
                    .route(web::get().to(open)),
            ),
        )
        .await;

        let res = test::call_service(&app, test::TestRequest::get().uri("/open").to_request()).await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[actix_web::test]
    async fn test_resolver_outage_is_internal_error() {
        let calls = web::Data::new(AtomicUsize::new(0));
        let limiter = RateLimiter::new(Arc::new(MemoryCounterStore::new()), policy(10));
        let app = test::init_service(
            App::new().app_data(calls.clone()).service(
                web::resource("/me")
                    .wrap(Protect::authenticated(Arc::new(BrokenResolver), limiter))
                    .route(web::get().to(whoami)),
            ),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/me")
            .insert_header((AUTHORIZATION, "Bearer anything"))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[actix_web::test]
    async fn test_public_routes_count_per_address() {
        let store = Arc::new(CountingStore::default());
        let calls = web::Data::new(AtomicUsize::new(0));
        let limiter = RateLimiter::new(store.clone(), policy(10));
        let app = test::init_service(
            App::new().app_data(calls.clone()).service(
                web::resource("/open")
                    .wrap(Protect::public(limiter))
                    .route(web::get().to(open)),
            ),
        )
        .await;

        let forwarded = test::TestRequest::get()
            .uri("/open")
            .insert_header(("x-forwarded-for", "203.0.113.9"))
            .to_request();
        assert_eq!(test::call_service(&app, forwarded).await.status(), StatusCode::OK);

        let direct = test::TestRequest::get()
            .uri("/open")
            .peer_addr("198.51.100.4:51234".parse().unwrap())
            .to_request();
        assert_eq!(test::call_service(&app, direct).await.status(), StatusCode::OK);

        assert_eq!(
            store.keys.lock().unwrap().as_slice(),
            [
                "rate_limit:ip:203.0.113.9".to_string(),
                "rate_limit:ip:198.51.100.4".to_string()
            ]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[actix_web::test]
    async fn test_handler_errors_pass_through() {
        async fn failing() -> Result<HttpResponse, ApiError> {
            Err(ApiError::Validation(vec![]))
        }

        let limiter = RateLimiter::new(Arc::new(MemoryCounterStore::new()), policy(10));
        let app = test::init_service(
            App::new().service(
                web::resource("/fail")
                    .wrap(Protect::public(limiter))
                    .route(web::post().to(failing)),
            ),
        )
        .await;

        let res = test::call_service(&app, test::TestRequest::post().uri("/fail").to_request()).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}
