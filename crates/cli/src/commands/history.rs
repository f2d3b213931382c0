use dataagent_core::domain::turn::ThreadId;
use dataagent_db::{
    connect_with_config, migrations, ConversationTurnRepository, SqlConversationTurnRepository,
};
use serde_json::json;

use crate::commands::{block_on, load_config, CommandResult};

pub fn show(thread_id: &str) -> CommandResult {
    let thread_id = match parse_thread("history show", thread_id) {
        Ok(thread_id) => thread_id,
        Err(failure) => return failure,
    };
    let config = match load_config("history show") {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    let result = block_on("history show", async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;
        let turns = SqlConversationTurnRepository::new(pool.clone())
            .select_by_thread(&thread_id)
            .await
            .map_err(|error| ("history_store", error.to_string(), 6u8))?;
        pool.close().await;
        Ok::<_, (&'static str, String, u8)>(turns)
    });

    match result {
        Ok(Ok(turns)) => CommandResult::success_with_data(
            "history show",
            format!("{} turns stored for thread `{thread_id}`", turns.len()),
            json!({ "thread_id": thread_id, "turns": turns }),
        ),
        Ok(Err((error_class, message, exit_code))) => {
            CommandResult::failure("history show", error_class, message, exit_code)
        }
        Err(failure) => failure,
    }
}

pub fn clear(thread_id: &str) -> CommandResult {
    let thread_id = match parse_thread("history clear", thread_id) {
        Ok(thread_id) => thread_id,
        Err(failure) => return failure,
    };
    let config = match load_config("history clear") {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    let result = block_on("history clear", async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;
        let removed = SqlConversationTurnRepository::new(pool.clone())
            .delete_all(&thread_id)
            .await
            .map_err(|error| ("history_store", error.to_string(), 6u8))?;
        pool.close().await;
        Ok::<_, (&'static str, String, u8)>(removed)
    });

    match result {
        Ok(Ok(removed)) => CommandResult::success_with_data(
            "history clear",
            format!("removed {removed} turns from thread `{thread_id}`"),
            json!({ "thread_id": thread_id, "removed": removed }),
        ),
        Ok(Err((error_class, message, exit_code))) => {
            CommandResult::failure("history clear", error_class, message, exit_code)
        }
        Err(failure) => failure,
    }
}

fn parse_thread(command: &str, raw: &str) -> Result<ThreadId, CommandResult> {
    let thread_id = ThreadId::new(raw.trim());
    if thread_id.is_blank() {
        return Err(CommandResult::failure(command, "invalid_argument", "thread id must not be blank", 2));
    }
    Ok(thread_id)
}
