use std::sync::Arc;

use sparrow::{FileLogger, MemoryBackend, Server, ServerConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::new()?;

    if config.open_log {
        FileLogger::new(&config.log_dir, config.log_level(), config.log_queue_size)?.install()?;
    }

    let users = Arc::new(MemoryBackend::new().pool(config.db_pool_size.max(1), config.db_wait()));

    let mut server = match Server::new(&config, users) {
        Ok(server) => server,
        Err(e) => {
            log::error!("========== Server init error! ==========");
            log::error!("{}", e);
            log::logger().flush();
            return Err(e.into());
        }
    };

    let result = server.run();
    log::logger().flush();
    Ok(result?)
}
