//! Single source-of-truth method table.
//!
//! Every method and notification the engine will route is enumerated here
//! with its allowed direction and whether it accepts task augmentation.
//! The engine refuses to dispatch a method outside the peer's allowed set,
//! before any handler or schema logic runs.

/// Which peer may issue a method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Only a client may send this to a server
    ClientToServer,
    /// Only a server may send this to a client
    ServerToClient,
    /// Either peer may send this
    Bidirectional,
}

/// Which side of the connection an engine is playing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSide {
    /// The connecting peer (LLM host)
    Client,
    /// The serving peer (tools/prompts/resources)
    Server,
}

impl PeerSide {
    /// Whether this side may issue the given direction
    pub fn may_send(self, direction: Direction) -> bool {
        match direction {
            Direction::Bidirectional => true,
            Direction::ClientToServer => self == Self::Client,
            Direction::ServerToClient => self == Self::Server,
        }
    }

    /// Whether this side may receive the given direction
    pub fn may_receive(self, direction: Direction) -> bool {
        match direction {
            Direction::Bidirectional => true,
            Direction::ClientToServer => self == Self::Server,
            Direction::ServerToClient => self == Self::Client,
        }
    }
}

/// A method table entry
#[derive(Debug, Clone, Copy)]
pub struct MethodDef {
    /// Wire method name
    pub name: &'static str,
    /// Allowed direction
    pub direction: Direction,
    /// Whether the method may return a task envelope instead of its result
    pub taskable: bool,
    /// Whether this entry names a notification rather than a request
    pub notification: bool,
}

const fn request(name: &'static str, direction: Direction) -> MethodDef {
    MethodDef {
        name,
        direction,
        taskable: false,
        notification: false,
    }
}

const fn taskable(name: &'static str, direction: Direction) -> MethodDef {
    MethodDef {
        name,
        direction,
        taskable: true,
        notification: false,
    }
}

const fn notification(name: &'static str, direction: Direction) -> MethodDef {
    MethodDef {
        name,
        direction,
        taskable: false,
        notification: true,
    }
}

/// All methods and notifications this engine routes
pub const METHODS: &[MethodDef] = &[
    // Lifecycle
    request("initialize", Direction::ClientToServer),
    request("ping", Direction::Bidirectional),
    // Tools
    request("tools/list", Direction::ClientToServer),
    taskable("tools/call", Direction::ClientToServer),
    // Prompts
    request("prompts/list", Direction::ClientToServer),
    request("prompts/get", Direction::ClientToServer),
    // Resources
    request("resources/list", Direction::ClientToServer),
    request("resources/templates/list", Direction::ClientToServer),
    request("resources/read", Direction::ClientToServer),
    request("resources/subscribe", Direction::ClientToServer),
    request("resources/unsubscribe", Direction::ClientToServer),
    // Logging
    request("logging/setLevel", Direction::ClientToServer),
    // Tasks
    request("tasks/get", Direction::ClientToServer),
    request("tasks/result", Direction::ClientToServer),
    request("tasks/list", Direction::ClientToServer),
    request("tasks/cancel", Direction::ClientToServer),
    // Server-initiated
    taskable("sampling/createMessage", Direction::ServerToClient),
    taskable("elicitation/create", Direction::ServerToClient),
    request("roots/list", Direction::ServerToClient),
    // Notifications
    notification("notifications/initialized", Direction::ClientToServer),
    notification("notifications/cancelled", Direction::Bidirectional),
    notification("notifications/progress", Direction::Bidirectional),
    notification("notifications/message", Direction::ServerToClient),
    notification("notifications/resources/updated", Direction::ServerToClient),
    notification("notifications/resources/list_changed", Direction::ServerToClient),
    notification("notifications/tools/list_changed", Direction::ServerToClient),
    notification("notifications/prompts/list_changed", Direction::ServerToClient),
    notification("notifications/tasks/status", Direction::Bidirectional),
    notification("notifications/roots/list_changed", Direction::ClientToServer),
];

/// Look up a method table entry by wire name
pub fn lookup(name: &str) -> Option<&'static MethodDef> {
    METHODS.iter().find(|m| m.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_has_no_duplicates() {
        for (i, a) in METHODS.iter().enumerate() {
            for b in &METHODS[i + 1..] {
                assert_ne!(a.name, b.name, "duplicate method entry: {}", a.name);
            }
        }
    }

    #[test]
    fn direction_gating() {
        let call = lookup("tools/call").unwrap();
        assert!(PeerSide::Client.may_send(call.direction));
        assert!(!PeerSide::Server.may_send(call.direction));
        assert!(PeerSide::Server.may_receive(call.direction));

        let sampling = lookup("sampling/createMessage").unwrap();
        assert!(PeerSide::Server.may_send(sampling.direction));
        assert!(!PeerSide::Client.may_send(sampling.direction));

        let ping = lookup("ping").unwrap();
        assert!(PeerSide::Client.may_send(ping.direction));
        assert!(PeerSide::Server.may_send(ping.direction));
    }

    #[test]
    fn taskable_methods() {
        assert!(lookup("tools/call").unwrap().taskable);
        assert!(lookup("sampling/createMessage").unwrap().taskable);
        assert!(lookup("elicitation/create").unwrap().taskable);
        assert!(!lookup("tools/list").unwrap().taskable);
    }

    #[test]
    fn unknown_method_absent() {
        assert!(lookup("nope/nothing").is_none());
    }
}
