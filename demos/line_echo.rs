use ez_tcp::tcp::{Connection, ConnectionHandler, TcpServer};
use log::info;
use std::collections::HashMap;
use std::time::Duration;

/// Echoes every complete line back in upper case; `quit` closes the connection.
#[derive(Default)]
struct LineEcho {
    partial: HashMap<Connection, Vec<u8>>,
}

impl ConnectionHandler for LineEcho {
    fn on_connected(&mut self, connection: &Connection) {
        info!("{connection} connected");
        let _ = connection.send_line("WELCOME");
    }

    fn on_data(&mut self, connection: &Connection, data: &[u8]) {
        let buffer = self.partial.entry(connection.clone()).or_default();
        buffer.extend_from_slice(data);

        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end();

            if line.eq_ignore_ascii_case("quit") {
                let _ = connection.send_line("BYE");
                connection.close();
                return;
            }
            if let Err(e) = connection.send_line(&line.to_uppercase()) {
                info!("{connection}: {e}");
                return;
            }
        }
    }

    fn on_closed(&mut self, connection: &Connection) {
        self.partial.remove(connection);
        info!("{connection} closed");
    }

    fn on_error(&mut self, connection: &Connection, cause: &ez_tcp::error::Error) {
        self.partial.remove(connection);
        info!("{connection} failed: {cause}");
    }
}

fn main() -> ez_tcp::error::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .init();

    let server = TcpServer::new("127.0.0.1", 7000)
        .set_idle_timeout(Duration::from_secs(60))
        .start(LineEcho::default())?;

    info!(
        "Try: nc {} {}",
        server.local_addr().map(|a| a.ip().to_string()).unwrap_or_default(),
        server.local_addr().map(|a| a.port()).unwrap_or_default()
    );

    std::thread::sleep(Duration::from_secs(300));
    let ended = server.stop();
    info!("Server ended: {:?}", ended.outcome());
    Ok(())
}
