use quote_bridge::defs::{
    BRIDGE_SERVER_PROTOCOL_VERSION, CALLBACK_METHOD, FAST_CALLBACK_METHOD, STDERR_METHOD,
    STDOUT_METHOD,
};
use quote_bridge::errors::codes;
use quote_bridge::protocol::Frame;
use serde_json::{Value, json};
use std::io::{self, BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::thread;
use structopt::StructOpt;

/// Command-line options for the client
#[derive(Debug, StructOpt)]
#[structopt(name = "bridge_client", about = "Interactive client for the quote bridge")]
struct Opt {
    /// TCP server address, e.g., 127.0.0.1:62787
    #[structopt(short, long, default_value = "127.0.0.1:62787")]
    server_addr: String,

    /// JSON value returned to every fast callback
    #[structopt(short, long, default_value = "true")]
    fast_answer: String,
}

const HELP: &str = "commands:
  accounts | classes | securities CLASS
  sub CLASS SEC PARAM | unsub CLASS SEC PARAM
  cb NAME | uncb NAME
  fast FUNCTION | release HANDLE
  raw METHOD [JSON]
  exit";

/// Connects to the bridge server
fn connect(addr: &str) -> io::Result<(TcpStream, BufReader<TcpStream>)> {
    let stream = TcpStream::connect(addr)?;
    let reader = BufReader::new(stream.try_clone()?);
    println!("Connected to bridge server at {}", addr);
    Ok((stream, reader))
}

/// Writes one frame as a JSON line
fn send_frame(stream: &Mutex<TcpStream>, frame: &Frame) -> io::Result<()> {
    let line = serde_json::to_string(frame).map_err(io::Error::other)?;
    let mut s = stream.lock().unwrap_or_else(|e| e.into_inner());
    s.write_all(line.as_bytes())?;
    s.write_all(b"\n")?;
    s.flush()
}

/// Turns a command line into a request method and params
fn parse_command(input: &str) -> Result<(String, Value), String> {
    let parts: Vec<&str> = input.split_whitespace().collect();
    let request = match parts.as_slice() {
        ["accounts"] => ("load-accounts", json!({})),
        ["classes"] => ("load-classes", json!({})),
        ["securities", class] => ("load-class-securities", json!({ "class": class })),
        ["sub", class, security, param] => (
            "subscribe-param-changes",
            json!({ "class": class, "security": security, "param": param }),
        ),
        ["unsub", class, security, param] => (
            "unsubscribe-param-changes",
            json!({ "class": class, "security": security, "param": param }),
        ),
        ["cb", name] => ("subscribe-callback", json!({ "name": name })),
        ["uncb", name] => ("unsubscribe-callback", json!({ "name": name })),
        ["fast", function] => ("register-fast-callback", json!({ "function": function })),
        ["release", handle] => {
            let handle: u64 = handle
                .parse()
                .map_err(|_| format!("bad handle '{}'", handle))?;
            ("release-fast-callback", json!({ "handle": handle }))
        }
        ["raw", method, ..] => {
            let rest = input
                .trim()
                .splitn(3, char::is_whitespace)
                .nth(2)
                .unwrap_or("{}");
            let params: Value =
                serde_json::from_str(rest).map_err(|e| format!("bad params: {}", e))?;
            return Ok((method.to_string(), params));
        }
        _ => return Err(HELP.to_string()),
    };
    Ok((request.0.to_string(), request.1))
}

/// Error answer for a server request this client does not handle
fn unknown_method(id: i64, method: &str) -> Frame {
    Frame::error(id, codes::UNKNOWN_METHOD, &format!("unknown method: {}", method))
}

/// Prints inbound frames and answers server-initiated requests
fn reader_loop(mut reader: BufReader<TcpStream>, stream: Arc<Mutex<TcpStream>>, fast_answer: Value) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => {
                println!("Server closed connection");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                eprintln!("Read failed: {}", e);
                return;
            }
        }

        let frame: Frame = match serde_json::from_str(line.trim()) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("Undecodable frame '{}': {}", line.trim(), e);
                continue;
            }
        };

        let reply = match frame {
            Frame::Version { version } => {
                println!("server protocol version {}", version);
                None
            }
            Frame::Push {
                subscription_id,
                value,
            } => {
                println!("push #{}: {}", subscription_id, value);
                None
            }
            Frame::Answer { id, result, error } => {
                match error {
                    Some(err) => println!("answer {}: error {} ({})", id, err.message, err.code),
                    None => println!("answer {}: {}", id, result.unwrap_or(Value::Null)),
                }
                None
            }
            Frame::Request { id, method, params } => match method.as_str() {
                FAST_CALLBACK_METHOD => {
                    println!("fast callback {}: {}", id, params);
                    Some(Frame::result(id, fast_answer.clone()))
                }
                CALLBACK_METHOD => {
                    println!("callback {}: {}", id, params);
                    Some(Frame::result(id, Value::Null))
                }
                STDOUT_METHOD | STDERR_METHOD => {
                    println!("[{}] {}", method, params["line"].as_str().unwrap_or_default());
                    None
                }
                _ => Some(unknown_method(id, &method)),
            },
            Frame::End => {
                println!("Server ended the stream");
                return;
            }
        };

        if let Some(reply) = reply {
            if let Err(e) = send_frame(&stream, &reply) {
                eprintln!("Failed to answer server: {}", e);
                return;
            }
        }
    }
}

/// Bridge client main loop
fn main() -> io::Result<()> {
    let opt = Opt::from_args();
    let fast_answer: Value = serde_json::from_str(&opt.fast_answer)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let (stream, reader) = connect(&opt.server_addr)?;
    let stream = Arc::new(Mutex::new(stream));

    send_frame(
        &stream,
        &Frame::Version {
            version: BRIDGE_SERVER_PROTOCOL_VERSION,
        },
    )?;

    {
        let stream = Arc::clone(&stream);
        thread::spawn(move || reader_loop(reader, stream, fast_answer));
    }

    // Interactive CLI loop
    let stdin = io::stdin();
    let mut next_id: i64 = 0;
    loop {
        print!("bridge-client> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            break;
        }
        let command = input.trim();

        if command.is_empty() {
            continue;
        }
        if command.eq_ignore_ascii_case("exit") {
            println!("Exiting client.");
            break;
        }

        match parse_command(command) {
            Ok((method, params)) => {
                next_id += 1;
                send_frame(&stream, &Frame::request(next_id, &method, params))?;
            }
            Err(msg) => println!("{}", msg),
        }
    }

    send_frame(&stream, &Frame::End)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_invalid_server() {
        let result = connect("127.0.0.1:1"); // assuming nothing is listening
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_subscribe() {
        let (method, params) = parse_command("sub TQBR SBER LAST").unwrap();
        assert_eq!(method, "subscribe-param-changes");
        assert_eq!(
            params,
            json!({"class": "TQBR", "security": "SBER", "param": "LAST"})
        );
    }

    #[test]
    fn test_parse_raw_and_release() {
        let (method, params) = parse_command("raw get-quote {\"class\": \"TQBR\"}").unwrap();
        assert_eq!(method, "get-quote");
        assert_eq!(params, json!({"class": "TQBR"}));

        let (method, params) = parse_command("raw get-quote").unwrap();
        assert_eq!(method, "get-quote");
        assert_eq!(params, json!({}));

        assert_eq!(
            parse_command("release 7").unwrap().1,
            json!({"handle": 7})
        );
        assert!(parse_command("release x").is_err());
        assert!(parse_command("bogus").is_err());
    }

    #[test]
    fn test_unknown_server_request_uses_unknown_method_code() {
        match unknown_method(4, "orderBook") {
            Frame::Answer {
                id: 4,
                error: Some(err),
                ..
            } => {
                assert_eq!(err.code, codes::UNKNOWN_METHOD);
                assert_eq!(err.message, "unknown method: orderBook");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
}
