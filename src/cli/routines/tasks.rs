//! The `tasks list` routine.

use comfy_table::{presets, Table};

use crate::cli::display::Message;
use crate::cli::routines::{RoutineFailure, RoutineSuccess};
use crate::framework::check::registry::TaskRegistry;

pub fn list_tasks(target: &str) -> Result<RoutineSuccess, RoutineFailure> {
    let registry = TaskRegistry::with_builtin_tasks();
    let infos = registry.list(target);

    if infos.is_empty() {
        return Err(RoutineFailure::error(Message::new(
            "Tasks".to_string(),
            format!("no tasks registered for target '{target}'"),
        )));
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_BORDERS_ONLY)
        .set_header(vec!["Task", "Description", "OS"]);
    for info in &infos {
        table.add_row(vec![
            info.name.to_string(),
            info.description.to_string(),
            info.supported_os
                .map(|os| os.join(", "))
                .unwrap_or_else(|| "any".to_string()),
        ]);
    }
    println!("{table}");

    Ok(RoutineSuccess::success(Message::new(
        "Tasks".to_string(),
        format!("{} registered for target '{target}'", infos.len()),
    )))
}
