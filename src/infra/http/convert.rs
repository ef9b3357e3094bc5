use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
};
use folio_api_types::{ConvertRequest, ConvertResponse};

use crate::application::{
    convert::ConversionRequest,
    error::{HttpError, MSG_INVALID_INPUT, MSG_PAYLOAD_TOO_LARGE},
};

use super::HttpState;

const SOURCE: &str = "infra::http::convert";

pub(super) async fn convert(
    State(state): State<HttpState>,
    payload: Result<Json<ConvertRequest>, JsonRejection>,
) -> Result<Json<ConvertResponse>, HttpError> {
    let Json(payload) = payload.map_err(rejection_to_http_error)?;
    let request = into_conversion_request(payload)?;
    let content = state.converter.convert(request).await?;
    Ok(Json(ConvertResponse {
        content: content.into(),
    }))
}

fn into_conversion_request(payload: ConvertRequest) -> Result<ConversionRequest, HttpError> {
    let invalid = |detail: &str| {
        HttpError::new(SOURCE, StatusCode::BAD_REQUEST, MSG_INVALID_INPUT, detail)
    };

    let document = match payload.input {
        Some(input) if !input.is_empty() => input.into_inner(),
        _ => return Err(invalid("request is missing `input`")),
    };
    let template = match payload.template {
        Some(template) if !template.is_empty() => template,
        _ => return Err(invalid("request is missing `template`")),
    };
    let resources = payload
        .resources
        .unwrap_or_default()
        .into_iter()
        .map(|(path, content)| (path, content.into_inner()))
        .collect();

    Ok(ConversionRequest {
        document,
        resources,
        template: Some(template),
    })
}

fn rejection_to_http_error(rejection: JsonRejection) -> HttpError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return HttpError::new(
            SOURCE,
            StatusCode::PAYLOAD_TOO_LARGE,
            MSG_PAYLOAD_TOO_LARGE,
            rejection.body_text(),
        );
    }
    HttpError::new(
        SOURCE,
        StatusCode::BAD_REQUEST,
        MSG_INVALID_INPUT,
        rejection.body_text(),
    )
}
