//! Pages (clients) the worker can talk to.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use url::Url;

use crate::error::WorkerError;
use crate::message::ClientMessage;
use crate::worker::ServiceWorkerId;

/// Whether a page at `url` falls under `scope`.
pub fn in_scope(scope: &Url, url: &Url) -> bool {
    url.as_str().starts_with(scope.as_str())
}

/// Client identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(String);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
    All,
}

/// Visibility state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityState {
    Hidden,
    Visible,
}

/// A page connected to the registration.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub url: Url,
    pub client_type: ClientType,
    pub visibility_state: VisibilityState,
    pub focused: bool,
    /// Worker currently controlling this page.
    pub controller: Option<ServiceWorkerId>,
    sender: mpsc::UnboundedSender<ClientMessage>,
}

impl Client {
    /// Post message to client.
    pub fn post_message(&self, message: ClientMessage) -> Result<(), WorkerError> {
        self.sender
            .send(message)
            .map_err(|_| WorkerError::State(format!("client {} is gone", self.id.as_str())))
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Page side of a connection: the client id plus its inbox.
#[derive(Debug)]
pub struct ClientConnection {
    pub id: ClientId,
    pub messages: mpsc::UnboundedReceiver<ClientMessage>,
}

/// Options for [`Clients::match_all`].
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<ClientId, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a page of the given type.
    pub fn connect(&mut self, url: Url, client_type: ClientType) -> ClientConnection {
        let (sender, messages) = mpsc::unbounded_channel();
        let id = ClientId::new();
        debug!(client = id.as_str(), url = %url, "Client connected");
        self.clients.insert(
            id.clone(),
            Client {
                id: id.clone(),
                url,
                client_type,
                visibility_state: VisibilityState::Visible,
                focused: false,
                controller: None,
                sender,
            },
        );
        ClientConnection { id, messages }
    }

    /// Get a client by ID.
    pub fn get(&self, id: &ClientId) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Match all clients, sorted by id for stable ordering.
    pub fn match_all(&self, options: &ClientMatchOptions) -> Vec<&Client> {
        let mut matched: Vec<&Client> = self
            .clients
            .values()
            .filter(|c| options.include_uncontrolled || c.controller.is_some())
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    /// Make `worker` the controller of every client under `scope`.
    /// Returns how many changed hands.
    pub fn claim(&mut self, worker: ServiceWorkerId, scope: &Url) -> usize {
        let mut claimed = 0;
        for client in self.clients.values_mut() {
            if client.controller != Some(worker) && in_scope(scope, &client.url) {
                client.controller = Some(worker);
                claimed += 1;
            }
        }
        claimed
    }

    /// Put one client under `worker`. Returns `false` for unknown clients.
    pub fn control(&mut self, id: &ClientId, worker: ServiceWorkerId) -> bool {
        match self.clients.get_mut(id) {
            Some(client) => {
                client.controller = Some(worker);
                true
            }
            None => false,
        }
    }

    /// Push a message to every client. Closed clients are dropped.
    /// Returns how many clients received it.
    pub fn broadcast(&mut self, message: &ClientMessage) -> usize {
        let mut delivered = 0;
        self.clients.retain(|id, client| match client.post_message(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(_) => {
                trace!(client = id.as_str(), "Dropping closed client");
                false
            }
        });
        delivered
    }

    /// Open a window client.
    pub fn open_window(&mut self, url: Url) -> ClientConnection {
        let connection = self.connect(url, ClientType::Window);
        self.focus(&connection.id).ok();
        connection
    }

    /// Focus a window client, unfocusing every other window.
    pub fn focus(&mut self, id: &ClientId) -> Result<(), WorkerError> {
        match self.clients.get(id) {
            Some(client) if client.client_type != ClientType::Window => {
                return Err(WorkerError::State(
                    "Can only focus window clients".to_string(),
                ));
            }
            Some(_) => {}
            None => return Err(WorkerError::State(format!("unknown client {}", id.as_str()))),
        }
        for client in self.clients.values_mut() {
            client.focused = &client.id == id;
        }
        Ok(())
    }

    /// First window client whose URL matches.
    pub fn find_window(&self, url: &Url) -> Option<&Client> {
        self.match_all(&ClientMatchOptions {
            include_uncontrolled: true,
            client_type: ClientType::Window,
        })
        .into_iter()
        .find(|c| &c.url == url)
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &ClientId) -> Option<Client> {
        self.clients.remove(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
