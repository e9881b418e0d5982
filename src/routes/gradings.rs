use actix_web::{HttpResponse, Responder, delete, get, post, web};
use serde::{Deserialize, Serialize};

use super::{scheduler_error_response, store_error_response};
use crate::grading::{GradingConfigId, SubmissionId};
use crate::scheduler::{Scheduler, TicketId};
use crate::store::ResultStore;

#[derive(Serialize, Deserialize, Debug)]
pub struct GradingRequest {
    pub submission_id: SubmissionId,
    pub grading_config_id: GradingConfigId,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[post("/gradings")]
pub async fn post_grading_handler(
    scheduler: web::Data<Scheduler>,
    body: web::Json<GradingRequest>,
) -> impl Responder {
    let GradingRequest {
        submission_id,
        grading_config_id,
    } = body.into_inner();

    match scheduler
        .into_inner()
        .enqueue(submission_id, grading_config_id)
        .await
    {
        Ok(view) => {
            log::info!(
                "Accepted grading of submission {submission_id} as ticket {}",
                view.ticket
            );
            HttpResponse::Created().json(view)
        }
        Err(e) => {
            log::info!("Rejected grading of submission {submission_id}: {e}");
            scheduler_error_response(&e)
        }
    }
}

#[get("/gradings/{ticket}")]
pub async fn get_grading_handler(
    scheduler: web::Data<Scheduler>,
    path: web::Path<(u64,)>,
) -> impl Responder {
    let ticket = TicketId(path.into_inner().0);
    match scheduler.status(ticket) {
        Ok(view) => HttpResponse::Ok().json(view),
        Err(e) => scheduler_error_response(&e),
    }
}

#[delete("/gradings/{ticket}")]
pub async fn delete_grading_handler(
    scheduler: web::Data<Scheduler>,
    path: web::Path<(u64,)>,
) -> impl Responder {
    let ticket = TicketId(path.into_inner().0);
    match scheduler.cancel(ticket).await {
        Ok(cancelled) => HttpResponse::Ok().json(CancelResponse { cancelled }),
        Err(e) => scheduler_error_response(&e),
    }
}

#[get("/submissions/{id}/results")]
pub async fn get_submission_results_handler(
    store: web::Data<dyn ResultStore>,
    path: web::Path<(i64,)>,
) -> impl Responder {
    let submission = SubmissionId(path.into_inner().0);
    match store.results_for(submission).await {
        Ok(results) => {
            log::debug!(
                "Got {} result(s) of submission {submission}",
                results.len()
            );
            HttpResponse::Ok().json(results)
        }
        Err(e) => store_error_response(&e),
    }
}
