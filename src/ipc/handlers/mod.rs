pub mod alertas;
pub mod auditoria;
pub mod calificaciones;
pub mod core;
pub mod estudiantes;
pub mod evidencias;
pub mod evidencias_columna;
pub mod evidencias_wide;
pub mod fichas;
pub mod maintenance;
pub mod materias;
pub mod setup;
pub mod users;
