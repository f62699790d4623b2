use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

type Handler = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

// First claim wins; each handler answers None for methods it does not own.
const HANDLERS: &[Handler] = &[
    handlers::core::try_handle,
    handlers::setup::try_handle,
    handlers::fichas::try_handle,
    handlers::materias::try_handle,
    handlers::users::try_handle,
    handlers::estudiantes::try_handle,
    handlers::calificaciones::try_handle,
    handlers::evidencias_wide::try_handle,
    handlers::evidencias_columna::try_handle,
    handlers::evidencias::try_handle,
    handlers::alertas::try_handle,
    handlers::auditoria::try_handle,
    handlers::maintenance::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    for handler in HANDLERS {
        if let Some(resp) = handler(state, &req) {
            return resp;
        }
    }

    let message = format!("unknown method: {}", req.method);
    err(&req.id, "not_implemented", message, None)
}
