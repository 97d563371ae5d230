//! Echo server. Try it with:
//!
//!     cargo run --example echo -- --port 5007 --loops 2
//!     printf 'hello' | nc 127.0.0.1 5007

use std::time::Duration;

use hive::{serve, Action, Config, Conn, Events, RingBuffer, ServerInfo};
use log::info;

struct Echo {
    trace: bool,
}

impl Events for Echo {
    type Context = ();

    fn serving(&self, srv: &ServerInfo) -> Action {
        for addr in &srv.addrs {
            info!("echo server started on {} (loops: {})", addr, srv.num_loops);
        }
        Action::None
    }

    fn data(&self, _conn: &Conn<()>, input: &mut RingBuffer) -> (Vec<u8>, Action) {
        let (head, tail) = input.peek_all();
        let mut out = head.to_vec();
        out.extend_from_slice(tail);
        input.retrieve_all();

        if self.trace {
            info!("{}", String::from_utf8_lossy(&out).trim_end());
        }

        (out, Action::None)
    }
}

fn main() {
    env_logger::init();

    let mut port = 5007u16;
    let mut loops = 1i32;
    let mut udp = false;
    let mut reuseport = false;
    let mut trace = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" => port = args.next().and_then(|v| v.parse().ok()).expect("--port N"),
            "--loops" => loops = args.next().and_then(|v| v.parse().ok()).expect("--loops N"),
            "--udp" => udp = true,
            "--reuseport" => reuseport = true,
            "--trace" => trace = true,
            other => panic!("unknown flag {:?}", other),
        }
    }

    let scheme = if udp { "udp" } else { "tcp" };
    let addr = format!("{}://:{}?reuseport={}", scheme, port, reuseport);

    let config = Config {
        num_loops: loops,
        wait_timeout: Some(Duration::from_secs(10)),
        ..Config::default()
    };

    serve(Echo { trace }, config, &[addr.as_str()]).expect("serve");
}
