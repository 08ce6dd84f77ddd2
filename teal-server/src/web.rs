use anyhow::{Context, Result};
use axum::{
    extract::{
        multipart::MultipartError, rejection::FormRejection, DefaultBodyLimit, Form, FromRequest,
        Multipart, Request, State,
    },
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::collections::HashMap;
use std::sync::Arc;
use teal_core::{
    error_response, IsolationConfig, ProcessIsolation, ServiceConfig, TealError, UploadRequest,
    UploadResponse, UploadService, UploadedFile, WorkspaceJanitor,
};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    service: UploadService,
}

/// Build the router, nested under the configured base url
pub fn router(service: UploadService) -> Router {
    let max_upload_bytes = service.config().max_upload_bytes;
    let prefix = service.config().route_prefix().to_string();

    let app = Router::new()
        .route("/", get(landing))
        .route("/healthz", get(healthz))
        .route("/api/v1/upload", post(upload))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .with_state(AppState { service });

    if prefix.is_empty() {
        app
    } else {
        Router::new().nest(&prefix, app)
    }
}

/// Service backed by the real subprocess runner
pub fn build_service(config: ServiceConfig) -> UploadService {
    let runner = ProcessIsolation::with_config(IsolationConfig::from_service_config(&config));
    UploadService::new(Arc::new(config), Arc::new(runner))
}

pub async fn start_server(config: ServiceConfig) -> Result<()> {
    config.validate().context("invalid configuration")?;

    tokio::fs::create_dir_all(&config.data_root)
        .await
        .with_context(|| format!("cannot create data root {}", config.data_root.display()))?;

    if config.retention.enabled {
        let janitor = WorkspaceJanitor::new(config.data_root.clone(), config.retention.clone());
        tokio::spawn(janitor.run());
    }

    let bind_addr = format!("{}:{}", config.host, config.port);
    info!(
        executable = %config.executable,
        workers = config.max_concurrent_analyses,
        data_root = %config.data_root.display(),
        "Starting trace server on {}",
        bind_addr
    );

    let app = router(build_service(config));
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("cannot bind {}", bind_addr))?;
    info!("Trace server listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Trace server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn healthz() -> &'static str {
    "ok"
}

/// Body encodings the upload endpoint understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FormEncoding {
    Multipart,
    UrlEncoded,
    /// Missing or unrelated content type, read as an empty form
    Other,
}

impl FormEncoding {
    fn from_headers(headers: &HeaderMap) -> Self {
        let essence = headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(';').next())
            .map(|mime| mime.trim().to_ascii_lowercase())
            .unwrap_or_default();

        match essence.as_str() {
            "multipart/form-data" => FormEncoding::Multipart,
            "application/x-www-form-urlencoded" => FormEncoding::UrlEncoded,
            _ => FormEncoding::Other,
        }
    }
}

async fn upload(State(state): State<AppState>, request: Request) -> Response {
    let config = state.service.config();
    let encoding = FormEncoding::from_headers(request.headers());
    let upload = match encoding {
        FormEncoding::Multipart => match Multipart::from_request(request, &()).await {
            Ok(multipart) => read_upload_form(multipart, config).await,
            Err(rejection) => Err(TealError::MalformedUpload(rejection.body_text())),
        },
        FormEncoding::UrlEncoded => {
            match Form::<HashMap<String, String>>::from_request(request, &()).await {
                Ok(Form(fields)) => Ok(UploadRequest {
                    sample: fields.contains_key(&config.sample_field),
                    file: None,
                }),
                Err(rejection) => Err(form_error(rejection, config)),
            }
        }
        FormEncoding::Other => Ok(UploadRequest::default()),
    };

    let response = match upload {
        Ok(upload) => run_detached(state.service.clone(), upload).await,
        Err(err) => error_response(&err),
    };
    into_http(response)
}

/// Collect the trace and sample flag from the multipart body
async fn read_upload_form(
    mut multipart: Multipart,
    config: &ServiceConfig,
) -> std::result::Result<UploadRequest, TealError> {
    let mut request = UploadRequest::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, config))?
    {
        let name = field.name().unwrap_or_default().to_string();

        if name == config.sample_field {
            request.sample = true;
        } else if name == config.file_field && request.file.is_none() {
            // A part without a filename is a plain form value, not a file
            let Some(filename) = field.file_name().map(str::to_string) else {
                continue;
            };
            let bytes = field.bytes().await.map_err(|e| multipart_error(e, config))?;
            request.file = Some(UploadedFile::new(filename, bytes.to_vec()));
        }
    }

    Ok(request)
}

fn form_error(rejection: FormRejection, config: &ServiceConfig) -> TealError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        TealError::PayloadTooLarge {
            limit: config.max_upload_bytes,
        }
    } else {
        TealError::MalformedUpload(rejection.body_text())
    }
}

fn multipart_error(err: MultipartError, config: &ServiceConfig) -> TealError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        TealError::PayloadTooLarge {
            limit: config.max_upload_bytes,
        }
    } else {
        TealError::MalformedUpload(err.body_text())
    }
}

/// The analyzer keeps running if the client goes away, and a panic stays inside this request
async fn run_detached(service: UploadService, request: UploadRequest) -> UploadResponse {
    match tokio::spawn(async move { service.handle_upload(request).await }).await {
        Ok(response) => response,
        Err(e) => error_response(&TealError::Internal(format!("upload task failed: {}", e))),
    }
}

fn into_http(response: UploadResponse) -> Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(response.body)).into_response()
}

async fn landing(State(state): State<AppState>) -> Html<String> {
    let config = state.service.config();
    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Teal</title>
</head>
<body>
    <h1>Teal: Sanger trace basecalling</h1>
    <form action="{prefix}/api/v1/upload" method="post" enctype="multipart/form-data">
        <input type="file" name="{file_field}" accept="{accept}">
        <button type="submit">Analyze</button>
    </form>
    <form action="{prefix}/api/v1/upload" method="post" enctype="multipart/form-data">
        <input type="hidden" name="{sample_field}" value="1">
        <button type="submit">Show example</button>
    </form>
</body>
</html>
"#,
        prefix = config.route_prefix(),
        file_field = config.file_field,
        sample_field = config.sample_field,
        accept = config
            .normalized_extensions()
            .iter()
            .map(|ext| format!(".{}", ext))
            .collect::<Vec<_>>()
            .join(","),
    ))
}
