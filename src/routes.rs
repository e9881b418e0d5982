mod gradings;

pub use gradings::*;

use actix_web::error::{InternalError, JsonPayloadError};
use actix_web::{HttpRequest, HttpResponse};
use serde::Serialize;

use crate::error::{SchedulerError, StoreError};

#[derive(Serialize)]
struct ErrorResponse {
    reason: &'static str,
    code: u32,
}

#[derive(Serialize)]
struct ErrorResponseWithMessage {
    reason: &'static str,
    code: u32,
    message: String,
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponse {
        reason: "ERR_INVALID_ARGUMENT",
        code: 1,
    });
    InternalError::from_response(err, response).into()
}

fn store_error_response(e: &StoreError) -> HttpResponse {
    match e {
        StoreError::SubmissionNotFound(_) | StoreError::GradingConfigNotFound(_) => {
            HttpResponse::NotFound().json(ErrorResponseWithMessage {
                reason: "ERR_NOT_FOUND",
                code: 3,
                message: e.to_string(),
            })
        }
        StoreError::InvalidGradingConfig(_) => {
            HttpResponse::BadRequest().json(ErrorResponseWithMessage {
                reason: "ERR_INVALID_ARGUMENT",
                code: 1,
                message: e.to_string(),
            })
        }
        StoreError::Encode(_) | StoreError::Database(_) => {
            log::error!("Store failure while serving request: {e}");
            HttpResponse::InternalServerError().json(ErrorResponse {
                reason: "ERR_EXTERNAL",
                code: 5,
            })
        }
    }
}

fn scheduler_error_response(e: &SchedulerError) -> HttpResponse {
    match e {
        SchedulerError::UnknownTicket(_) => HttpResponse::NotFound().json(ErrorResponseWithMessage {
            reason: "ERR_NOT_FOUND",
            code: 3,
            message: e.to_string(),
        }),
        SchedulerError::UnknownPool(_) => {
            HttpResponse::BadRequest().json(ErrorResponseWithMessage {
                reason: "ERR_INVALID_ARGUMENT",
                code: 1,
                message: e.to_string(),
            })
        }
        SchedulerError::ShuttingDown => {
            HttpResponse::ServiceUnavailable().json(ErrorResponseWithMessage {
                reason: "ERR_EXTERNAL",
                code: 5,
                message: e.to_string(),
            })
        }
        SchedulerError::Store(e) => store_error_response(e),
    }
}
