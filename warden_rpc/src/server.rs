//! Blocking RPC server: one thread per accepted connection, every
//! request dispatched to the shared handler.

use crate::{
    conn::{recv_msg, send_msg, FrameError},
    ConnectArgs, ConnectRes, NewInputArgs, PollArgs, PollRes, Reply, Request,
};
use std::{
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::Arc,
    thread,
};
use thiserror::Error;

/// The manager side of the protocol. Handler errors are returned to the
/// client; they never tear the connection down.
pub trait Handler: Send + Sync + 'static {
    fn connect(&self, args: ConnectArgs) -> Result<ConnectRes, String>;
    fn new_input(&self, args: NewInputArgs) -> Result<(), String>;
    fn poll(&self, args: PollArgs) -> Result<PollRes, String>;
}

/// Accept loop; runs until the process exits. Accept errors are logged
/// and do not stop serving.
pub fn serve<H: Handler>(listener: TcpListener, handler: Arc<H>) {
    loop {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(err) => {
                log::error!("failed to accept an rpc connection: {}", err);
                continue;
            }
        };
        let handler = Arc::clone(&handler);
        thread::spawn(move || serve_conn(stream, handler));
    }
}

fn serve_conn<H: Handler>(mut stream: TcpStream, handler: Arc<H>) {
    loop {
        let request: Request = match recv_msg(&mut stream) {
            Ok(request) => request,
            Err(err) => {
                if !err.is_disconnect() {
                    log::warn!("rpc connection error: {}", err);
                }
                return;
            }
        };
        let sent = match request {
            Request::Connect(args) => send_msg(&mut stream, &reply(handler.connect(args))),
            Request::NewInput(args) => send_msg(&mut stream, &reply(handler.new_input(args))),
            Request::Poll(args) => send_msg(&mut stream, &reply(handler.poll(args))),
        };
        if let Err(err) = sent {
            if !err.is_disconnect() {
                log::warn!("rpc connection error: {}", err);
            }
            return;
        }
    }
}

fn reply<T>(result: Result<T, String>) -> Reply<T> {
    match result {
        Ok(value) => Reply::Ok(value),
        Err(msg) => Reply::Err(msg),
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("remote: {0}")]
    Remote(String),
}

/// Fuzzer side of the protocol; also what the manager's own tests speak.
pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub fn dial<A: ToSocketAddrs>(addr: A) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).map_err(FrameError::from)?;
        Ok(Self { stream })
    }

    pub fn connect(&mut self, name: &str) -> Result<ConnectRes, ClientError> {
        self.call(&Request::Connect(ConnectArgs {
            name: name.to_string(),
        }))
    }

    pub fn new_input(&mut self, args: NewInputArgs) -> Result<(), ClientError> {
        self.call(&Request::NewInput(args))
    }

    pub fn poll(&mut self, args: PollArgs) -> Result<PollRes, ClientError> {
        self.call(&Request::Poll(args))
    }

    fn call<T: serde::de::DeserializeOwned>(&mut self, req: &Request) -> Result<T, ClientError> {
        send_msg(&mut self.stream, req)?;
        match recv_msg(&mut self.stream)? {
            Reply::Ok(value) => Ok(value),
            Reply::Err(msg) => Err(ClientError::Remote(msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct EchoHandler {
        connects: Mutex<Vec<String>>,
    }

    impl Handler for EchoHandler {
        fn connect(&self, args: ConnectArgs) -> Result<ConnectRes, String> {
            self.connects.lock().unwrap().push(args.name);
            Ok(ConnectRes {
                prios: vec![vec![1.0]],
                enabled_calls: "0,1".to_string(),
            })
        }

        fn new_input(&self, args: NewInputArgs) -> Result<(), String> {
            if args.input.call.is_empty() {
                return Err("empty call".to_string());
            }
            Ok(())
        }

        fn poll(&self, _args: PollArgs) -> Result<PollRes, String> {
            Ok(PollRes::default())
        }
    }

    #[test]
    fn dispatch_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handler = Arc::new(EchoHandler {
            connects: Mutex::new(Vec::new()),
        });
        let server_handler = Arc::clone(&handler);
        thread::spawn(move || serve(listener, server_handler));

        let mut client = Client::dial(addr).unwrap();
        let res = client.connect("vm-3").unwrap();
        assert_eq!(res.enabled_calls, "0,1");
        {
            let connects = handler.connects.lock().unwrap();
            assert_eq!(connects.len(), 1);
            assert_eq!(connects[0], "vm-3");
        }

        let err = client
            .new_input(NewInputArgs {
                name: "vm-3".to_string(),
                input: crate::CorpusInput {
                    call: String::new(),
                    prog: b"x".to_vec(),
                    cover: Default::default(),
                },
            })
            .unwrap_err();
        assert!(matches!(err, ClientError::Remote(msg) if msg == "empty call"));

        // the connection survives a handler error
        let res = client.poll(PollArgs {
            name: "vm-3".to_string(),
            stats: Default::default(),
        });
        assert!(res.is_ok());
    }
}
