use std::sync::Arc;

use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::ServerConfig;
use crate::routes::{
    delete_grading_handler, get_grading_handler, get_submission_results_handler,
    json_error_handler, post_grading_handler,
};
use crate::scheduler::Scheduler;
use crate::store::ResultStore;

pub fn build_server(
    server_config: ServerConfig,
    scheduler: Arc<Scheduler>,
    results: Arc<dyn ResultStore>,
) -> std::io::Result<Server> {
    let scheduler = web::Data::from(scheduler);
    let results: web::Data<dyn ResultStore> = web::Data::from(results);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(scheduler.clone())
            .app_data(results.clone())
            .app_data(web::JsonConfig::default().error_handler(json_error_handler))
            .wrap(middleware::Logger::default())
            .service(post_grading_handler)
            .service(get_grading_handler)
            .service(delete_grading_handler)
            .service(get_submission_results_handler)
    })
    .bind((
        server_config
            .bind_address
            .unwrap_or_else(|| "127.0.0.1".to_string()),
        server_config.bind_port.unwrap_or(12345),
    ))?
    .run();

    Ok(server)
}
