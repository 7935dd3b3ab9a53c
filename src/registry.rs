use std::collections::HashMap;
use std::io::Error;
use std::net::{Shutdown, TcpStream};
use std::sync::Mutex;

use log::{debug, warn};

/// Sockets belonging to in-flight fetches.
///
/// A fetch registers its socket for the duration of the connection and
/// unregisters on completion, success or not. Close-all shuts every
/// registered socket down, which unblocks any fetch sitting in a read.
pub struct FetchRegistry {
    inner: Mutex<Registered>,
}

struct Registered {
    next_token: u64,
    sockets: HashMap<u64, TcpStream>,
}

#[derive(Debug)]
pub struct SocketToken(u64);

impl FetchRegistry {
    pub fn new() -> FetchRegistry {
        FetchRegistry {
            inner: Mutex::new(Registered {
                next_token: 0,
                sockets: HashMap::new(),
            }),
        }
    }

    /// Registers a clone of the socket so close-all can reach it while the
    /// fetch keeps reading from the original.
    pub fn register(&self, socket: &TcpStream) -> Result<SocketToken, Error> {
        let clone = socket.try_clone()?;
        let mut inner = self.inner.lock().unwrap();
        let token = inner.next_token;
        inner.next_token += 1;
        inner.sockets.insert(token, clone);
        debug!("registered fetch socket {}", token);
        Ok(SocketToken(token))
    }

    pub fn unregister(&self, token: SocketToken) {
        let mut inner = self.inner.lock().unwrap();
        inner.sockets.remove(&token.0);
        debug!("unregistered fetch socket {}", token.0);
    }

    /// Force-closes every registered socket. Safe to call repeatedly, a
    /// second call observes an empty set.
    pub fn close_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        for (token, socket) in inner.sockets.drain() {
            if let Err(e) = socket.shutdown(Shutdown::Both) {
                warn!("shutdown of fetch socket {} failed: {}", token, e);
            } else {
                debug!("shut down fetch socket {}", token);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().sockets.is_empty()
    }
}

impl Default for FetchRegistry {
    fn default() -> FetchRegistry {
        FetchRegistry::new()
    }
}

#[cfg(test)]
mod test_registry {
    use super::*;
    use std::io::Read;
    use std::net::TcpListener;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn register_unregister() {
        let registry = FetchRegistry::new();
        let (client, _server) = socket_pair();

        let token = registry.register(&client).unwrap();
        assert!(!registry.is_empty());
        registry.unregister(token);
        assert!(registry.is_empty());
    }

    #[test]
    fn close_all_unblocks_reader() {
        let registry = FetchRegistry::new();
        let (mut client, _server) = socket_pair();

        let token = registry.register(&client).unwrap();
        registry.close_all();
        assert!(registry.is_empty());

        // The original socket hits end of stream instead of blocking forever
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).unwrap_or(0);
        assert_eq!(n, 0);

        // Token outlived the drain, unregister is a no-op
        registry.unregister(token);
    }

    #[test]
    fn close_all_twice_is_a_noop() {
        let registry = FetchRegistry::new();
        registry.close_all();
        registry.close_all();
        assert!(registry.is_empty());
    }
}
