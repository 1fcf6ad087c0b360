use std::sync::Arc;

use actix_web::http::header::ETAG;
use actix_web::web::{Bytes, Either, Form, FormConfig, Json, JsonConfig};
use actix_web::{error, get, post, web, HttpRequest, HttpResponse, Responder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::auth::{Principal, PrincipalResolver};
use crate::balance::BalanceSnapshot;
use crate::error::ApiError;
use crate::guard::Protect;
use crate::insights::{InsightProvider, InsightRequest};
use crate::ledger::{DbScope, LedgerStore, StoreError};
use crate::rate_limit::RateLimiter;
use crate::structs::{non_blank, Transaction, TransactionRequest};
use crate::views::{DashboardViews, ViewInvalidator};
use crate::webhook::{verify_secret, Envelope, VoiceWebhook, SECRET_HEADER};

const RECENT_LIMIT: usize = 10;
const INSIGHT_HISTORY: usize = 50;

#[derive(Clone)]
pub struct AppData {
    ledger: Arc<dyn LedgerStore>,
    views: Arc<DashboardViews>,
    webhook: Arc<VoiceWebhook>,
    webhook_secret: Option<String>,
    resolver: Arc<dyn PrincipalResolver>,
    limiter: RateLimiter,
    insights: Arc<dyn InsightProvider>,
}

impl AppData {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        resolver: Arc<dyn PrincipalResolver>,
        limiter: RateLimiter,
        insights: Arc<dyn InsightProvider>,
        webhook_secret: Option<String>,
    ) -> Self {
        let views = Arc::new(DashboardViews::new());
        let webhook = Arc::new(VoiceWebhook::new(ledger.clone(), views.clone()));
        Self {
            ledger,
            views,
            webhook,
            webhook_secret,
            resolver,
            limiter,
            insights,
        }
    }
}

#[derive(Serialize)]
struct Dashboard {
    summary: BalanceSnapshot,
    recent: Vec<Transaction>,
    revision: u64,
}

#[post("/transactions")]
async fn add_transaction(
    app: web::Data<AppData>,
    principal: Principal,
    body: Either<Json<TransactionRequest>, Form<TransactionRequest>>,
) -> Result<HttpResponse, ApiError> {
    let request = match body {
        Either::Left(json) => json.into_inner(),
        Either::Right(form) => form.into_inner(),
    };
    let tx = request.validate().map_err(ApiError::Validation)?;
    let user = principal.user_id;

    let stored = app
        .ledger
        .insert(&DbScope::User(user.clone()), &user, tx)
        .await
        .map_err(|e| {
            error!(user = %user, error = %e, "Failed to add transaction");
            ApiError::store("Failed to add transaction", e)
        })?;
    app.views.invalidate(&user);
    info!(user = %user, transaction = %stored.id, "Transaction added");

    Ok(HttpResponse::Created().json(stored))
}

#[get("/balance")]
async fn balance(app: web::Data<AppData>, principal: Principal) -> Result<HttpResponse, ApiError> {
    let user = principal.user_id;
    let entries = app
        .ledger
        .entries(&DbScope::User(user.clone()), &user)
        .await
        .map_err(|e| {
            error!(user = %user, error = %e, "Failed to load balance");
            ApiError::store("Failed to load balance", e)
        })?;

    Ok(HttpResponse::Ok().json(BalanceSnapshot::from_entries(entries)))
}

#[get("/transactions/recent")]
async fn recent_transactions(
    app: web::Data<AppData>,
    principal: Principal,
) -> Result<HttpResponse, ApiError> {
    let user = principal.user_id;
    let recent = app
        .ledger
        .recent(&DbScope::User(user.clone()), &user, RECENT_LIMIT)
        .await
        .map_err(|e| {
            error!(user = %user, error = %e, "Failed to load transactions");
            ApiError::store("Failed to load transactions", e)
        })?;

    Ok(HttpResponse::Ok().json(recent))
}

#[get("/dashboard")]
async fn dashboard(app: web::Data<AppData>, principal: Principal) -> Result<HttpResponse, ApiError> {
    let user = principal.user_id;
    let scope = DbScope::User(user.clone());
    // Read before the data so a concurrent write can only make the tag stale.
    let revision = app.views.revision(&user);

    let load = |e: StoreError| {
        error!(user = %user, error = %e, "Failed to load dashboard");
        ApiError::store("Failed to load dashboard", e)
    };
    let entries = app.ledger.entries(&scope, &user).await.map_err(load)?;
    let recent = app
        .ledger
        .recent(&scope, &user, RECENT_LIMIT)
        .await
        .map_err(load)?;

    Ok(HttpResponse::Ok()
        .insert_header((ETAG, DashboardViews::etag(revision)))
        .json(Dashboard {
            summary: BalanceSnapshot::from_entries(entries),
            recent,
            revision,
        }))
}

#[derive(Debug, Default, Deserialize)]
struct AnalyzeRequest {
    #[serde(default)]
    query: Option<String>,
}

#[post("/ai/analyze")]
async fn analyze(
    app: web::Data<AppData>,
    principal: Principal,
    body: Bytes,
) -> Result<HttpResponse, ApiError> {
    // A missing or unreadable body means no question was asked.
    let request: AnalyzeRequest = serde_json::from_slice(&body).unwrap_or_default();
    let user = principal.user_id;

    let transactions = app
        .ledger
        .recent(&DbScope::User(user.clone()), &user, INSIGHT_HISTORY)
        .await
        .map_err(|e| {
            error!(user = %user, error = %e, "Failed to load transactions for insights");
            ApiError::Analysis
        })?;

    let insight = app
        .insights
        .generate(InsightRequest {
            transactions,
            query: non_blank(request.query),
        })
        .await
        .map_err(|e| {
            error!(user = %user, error = %e, "Failed to generate insight");
            ApiError::Analysis
        })?;

    Ok(HttpResponse::Ok().json(insight))
}

async fn vapi_webhook(
    app: web::Data<AppData>,
    req: HttpRequest,
    body: Bytes,
) -> Result<HttpResponse, actix_web::Error> {
    let presented = req
        .headers()
        .get(SECRET_HEADER)
        .and_then(|value| value.to_str().ok());
    if !verify_secret(app.webhook_secret.as_deref(), presented) {
        warn!("Webhook call with a bad platform secret");
        return Err(ApiError::Unauthorized.into());
    }

    let envelope: Envelope = serde_json::from_slice(&body).map_err(|e| {
        debug!(error = %e, "Unreadable webhook body");
        error::JsonPayloadError::Deserialize(e)
    })?;

    Ok(HttpResponse::Ok().json(app.webhook.process(envelope).await))
}

#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

/// Registers every route. The webhook resource sits under `/api` but is
/// registered ahead of the authenticated scope so the scope does not
/// capture it.
pub fn configure(app: AppData) -> impl FnOnce(&mut web::ServiceConfig) {
    move |cfg: &mut web::ServiceConfig| {
        let json = JsonConfig::default().error_handler(|err, _req| {
            debug!(error = %err, "Rejected JSON body");
            ApiError::InvalidPayload.into()
        });
        let form = FormConfig::default().error_handler(|err, _req| {
            debug!(error = %err, "Rejected form body");
            ApiError::InvalidPayload.into()
        });

        cfg.app_data(web::Data::new(app.clone()))
            .service(health)
            .service(
                web::resource("/api/ai/vapi")
                    .wrap(Protect::public(app.limiter.clone()))
                    .route(web::post().to(vapi_webhook)),
            )
            .service(
                web::scope("/api")
                    .wrap(Protect::authenticated(app.resolver.clone(), app.limiter.clone()))
                    .app_data(json)
                    .app_data(form)
                    .service(add_transaction)
                    .service(recent_transactions)
                    .service(balance)
                    .service(dashboard)
                    .service(analyze),
            );
    }
}
