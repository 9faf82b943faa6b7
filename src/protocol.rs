//! Wire Protocol
//!
//! Text-line protocol spoken between clients, storage nodes and the
//! controller. Every message is one line of space-separated tokens.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::state::NodeId;

pub const JOIN: &str = "JOIN";
pub const STORE: &str = "STORE";
pub const STORE_TO: &str = "STORE_TO";
pub const STORE_ACK: &str = "STORE_ACK";
pub const STORE_COMPLETE: &str = "STORE_COMPLETE";
pub const LOAD: &str = "LOAD";
pub const RELOAD: &str = "RELOAD";
pub const LOAD_FROM: &str = "LOAD_FROM";
pub const REMOVE: &str = "REMOVE";
pub const REMOVE_ACK: &str = "REMOVE_ACK";
pub const REMOVE_COMPLETE: &str = "REMOVE_COMPLETE";
pub const LIST: &str = "LIST";
pub const REBALANCE: &str = "REBALANCE";
pub const REBALANCE_COMPLETE: &str = "REBALANCE_COMPLETE";
pub const ERROR_FILE_ALREADY_EXISTS: &str = "ERROR_FILE_ALREADY_EXISTS";
pub const ERROR_FILE_DOES_NOT_EXIST: &str = "ERROR_FILE_DOES_NOT_EXIST";
pub const ERROR_NOT_ENOUGH_DSTORES: &str = "ERROR_NOT_ENOUGH_DSTORES";
pub const ERROR_LOAD: &str = "ERROR_LOAD";
pub const ERROR_STORE_FAILED: &str = "ERROR_STORE_FAILED";

/// First-line requests on a fresh connection, and everything a client sends
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// Storage node handshake; switches the connection into node mode
    Join { port: NodeId },
    Store { name: String, size: u64 },
    Load { name: String },
    Reload { name: String },
    Remove { name: String },
    List,
}

impl ClientRequest {
    /// Parse one line received from a client (or a node's handshake)
    pub fn parse(line: &str) -> Result<Self> {
        let mut tokens = line.split_whitespace();
        let command = tokens
            .next()
            .ok_or_else(|| Error::Protocol("empty request".into()))?;

        let request = match command {
            JOIN => ClientRequest::Join {
                port: field(tokens.next(), "port")?,
            },
            STORE => ClientRequest::Store {
                name: name(tokens.next())?,
                size: field(tokens.next(), "size")?,
            },
            LOAD => ClientRequest::Load { name: name(tokens.next())? },
            RELOAD => ClientRequest::Reload { name: name(tokens.next())? },
            REMOVE => ClientRequest::Remove { name: name(tokens.next())? },
            LIST => ClientRequest::List,
            other => return Err(Error::Protocol(format!("unknown command '{}'", other))),
        };

        no_trailing(tokens, command)?;
        Ok(request)
    }

    /// Command keyword, for logging
    pub fn command(&self) -> &'static str {
        match self {
            ClientRequest::Join { .. } => JOIN,
            ClientRequest::Store { .. } => STORE,
            ClientRequest::Load { .. } => LOAD,
            ClientRequest::Reload { .. } => RELOAD,
            ClientRequest::Remove { .. } => REMOVE,
            ClientRequest::List => LIST,
        }
    }
}

/// Messages a joined storage node pushes to the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeMessage {
    StoreAck { name: String },
    RemoveAck { name: String },
    /// The node was asked to remove a file it does not hold
    RemoveMissing { name: String },
    /// Reply to a `LIST` command: the files the node currently holds
    Inventory { files: Vec<String> },
    RebalanceComplete,
}

impl NodeMessage {
    pub fn parse(line: &str) -> Result<Self> {
        let mut tokens = line.split_whitespace();
        let command = tokens
            .next()
            .ok_or_else(|| Error::Protocol("empty node message".into()))?;

        let message = match command {
            STORE_ACK => NodeMessage::StoreAck { name: name(tokens.next())? },
            REMOVE_ACK => NodeMessage::RemoveAck { name: name(tokens.next())? },
            ERROR_FILE_DOES_NOT_EXIST => NodeMessage::RemoveMissing { name: name(tokens.next())? },
            LIST => {
                return Ok(NodeMessage::Inventory {
                    files: tokens.map(str::to_string).collect(),
                })
            }
            REBALANCE_COMPLETE => NodeMessage::RebalanceComplete,
            other => {
                return Err(Error::Protocol(format!("unknown node message '{}'", other)))
            }
        };

        no_trailing(tokens, command)?;
        Ok(message)
    }
}

/// Replies sent from the controller to a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    StoreTo(Vec<NodeId>),
    StoreComplete,
    LoadFrom { port: NodeId, size: u64 },
    RemoveComplete,
    List(Vec<String>),
    ErrorFileAlreadyExists,
    ErrorFileDoesNotExist,
    ErrorNotEnoughDstores,
    ErrorLoad,
    ErrorStoreFailed,
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::StoreTo(ports) => {
                write!(f, "{}", STORE_TO)?;
                for port in ports {
                    write!(f, " {}", port)?;
                }
                Ok(())
            }
            Reply::StoreComplete => write!(f, "{}", STORE_COMPLETE),
            Reply::LoadFrom { port, size } => write!(f, "{} {} {}", LOAD_FROM, port, size),
            Reply::RemoveComplete => write!(f, "{}", REMOVE_COMPLETE),
            Reply::List(files) => {
                write!(f, "{}", LIST)?;
                for file in files {
                    write!(f, " {}", file)?;
                }
                Ok(())
            }
            Reply::ErrorFileAlreadyExists => write!(f, "{}", ERROR_FILE_ALREADY_EXISTS),
            Reply::ErrorFileDoesNotExist => write!(f, "{}", ERROR_FILE_DOES_NOT_EXIST),
            Reply::ErrorNotEnoughDstores => write!(f, "{}", ERROR_NOT_ENOUGH_DSTORES),
            Reply::ErrorLoad => write!(f, "{}", ERROR_LOAD),
            Reply::ErrorStoreFailed => write!(f, "{}", ERROR_STORE_FAILED),
        }
    }
}

/// Work a node must do during one rebalance pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceInstruction {
    /// Files to copy, each with the nodes that should receive it
    pub sends: Vec<(String, Vec<NodeId>)>,
    /// Files to delete locally
    pub removes: Vec<String>,
}

impl RebalanceInstruction {
    pub fn is_empty(&self) -> bool {
        self.sends.is_empty() && self.removes.is_empty()
    }
}

/// Commands sent from the controller to a storage node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCommand {
    Remove { name: String },
    List,
    Rebalance(RebalanceInstruction),
}

impl NodeCommand {
    /// Parse a command as a storage node would receive it
    pub fn parse(line: &str) -> Result<Self> {
        let mut tokens = line.split_whitespace();
        let command = tokens
            .next()
            .ok_or_else(|| Error::Protocol("empty node command".into()))?;

        let parsed = match command {
            REMOVE => NodeCommand::Remove { name: name(tokens.next())? },
            LIST => NodeCommand::List,
            REBALANCE => {
                let mut instruction = RebalanceInstruction::default();
                let sends: usize = field(tokens.next(), "send count")?;
                for _ in 0..sends {
                    let file = name(tokens.next())?;
                    let dests: usize = field(tokens.next(), "destination count")?;
                    let ports = (0..dests)
                        .map(|_| field(tokens.next(), "destination port"))
                        .collect::<Result<Vec<NodeId>>>()?;
                    instruction.sends.push((file, ports));
                }
                let removes: usize = field(tokens.next(), "remove count")?;
                for _ in 0..removes {
                    instruction.removes.push(name(tokens.next())?);
                }
                NodeCommand::Rebalance(instruction)
            }
            other => {
                return Err(Error::Protocol(format!("unknown node command '{}'", other)))
            }
        };

        no_trailing(tokens, command)?;
        Ok(parsed)
    }
}

impl fmt::Display for NodeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeCommand::Remove { name } => write!(f, "{} {}", REMOVE, name),
            NodeCommand::List => write!(f, "{}", LIST),
            NodeCommand::Rebalance(instruction) => {
                write!(f, "{} {}", REBALANCE, instruction.sends.len())?;
                for (file, ports) in &instruction.sends {
                    write!(f, " {} {}", file, ports.len())?;
                    for port in ports {
                        write!(f, " {}", port)?;
                    }
                }
                write!(f, " {}", instruction.removes.len())?;
                for file in &instruction.removes {
                    write!(f, " {}", file)?;
                }
                Ok(())
            }
        }
    }
}

fn name(token: Option<&str>) -> Result<String> {
    token
        .map(str::to_string)
        .ok_or_else(|| Error::Protocol("missing file name".into()))
}

fn field<T: FromStr>(token: Option<&str>, what: &str) -> Result<T> {
    let token = token.ok_or_else(|| Error::Protocol(format!("missing {}", what)))?;
    token
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid {} '{}'", what, token)))
}

fn no_trailing<'a>(mut tokens: impl Iterator<Item = &'a str>, command: &str) -> Result<()> {
    match tokens.next() {
        Some(extra) => Err(Error::Protocol(format!(
            "unexpected token '{}' after {}",
            extra, command
        ))),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_client_requests() {
        assert_eq!(
            ClientRequest::parse("STORE x 100").unwrap(),
            ClientRequest::Store { name: "x".into(), size: 100 }
        );
        assert_eq!(ClientRequest::parse("JOIN 1001").unwrap(), ClientRequest::Join { port: 1001 });
        assert_eq!(ClientRequest::parse("RELOAD a.txt").unwrap(), ClientRequest::Reload { name: "a.txt".into() });
        assert_eq!(ClientRequest::parse("LIST").unwrap(), ClientRequest::List);
    }

    #[test]
    fn test_reject_malformed_requests() {
        assert!(ClientRequest::parse("").is_err());
        assert!(ClientRequest::parse("STORE x").is_err());
        assert!(ClientRequest::parse("STORE x big").is_err());
        assert!(ClientRequest::parse("JOIN 99999").is_err());
        assert!(ClientRequest::parse("LOAD a b").is_err());
        assert!(ClientRequest::parse("FETCH x").is_err());
    }

    #[test]
    fn test_parse_node_messages() {
        assert_eq!(NodeMessage::parse("STORE_ACK x").unwrap(), NodeMessage::StoreAck { name: "x".into() });
        assert_eq!(
            NodeMessage::parse("ERROR_FILE_DOES_NOT_EXIST x").unwrap(),
            NodeMessage::RemoveMissing { name: "x".into() }
        );
        assert_eq!(
            NodeMessage::parse("LIST a b").unwrap(),
            NodeMessage::Inventory { files: vec!["a".into(), "b".into()] }
        );
        assert_eq!(NodeMessage::parse("LIST").unwrap(), NodeMessage::Inventory { files: vec![] });
        assert_eq!(NodeMessage::parse("REBALANCE_COMPLETE").unwrap(), NodeMessage::RebalanceComplete);
        assert!(NodeMessage::parse("REMOVE_ACK").is_err());
    }

    #[test]
    fn test_format_replies() {
        assert_eq!(Reply::StoreTo(vec![1001, 1002, 1003]).to_string(), "STORE_TO 1001 1002 1003");
        assert_eq!(Reply::LoadFrom { port: 1002, size: 100 }.to_string(), "LOAD_FROM 1002 100");
        assert_eq!(Reply::List(vec![]).to_string(), "LIST");
        assert_eq!(Reply::List(vec!["a".into(), "b".into()]).to_string(), "LIST a b");
        assert_eq!(Reply::ErrorNotEnoughDstores.to_string(), "ERROR_NOT_ENOUGH_DSTORES");
    }

    #[test]
    fn test_rebalance_command_format() {
        let command = NodeCommand::Rebalance(RebalanceInstruction {
            sends: vec![("f1".into(), vec![1001, 1002]), ("f2".into(), vec![1003])],
            removes: vec!["f3".into()],
        });
        let line = command.to_string();
        assert_eq!(line, "REBALANCE 2 f1 2 1001 1002 f2 1 1003 1 f3");
        assert_eq!(NodeCommand::parse(&line).unwrap(), command);

        let empty = NodeCommand::Rebalance(RebalanceInstruction::default());
        assert_eq!(empty.to_string(), "REBALANCE 0 0");
    }

    #[test]
    fn test_truncated_rebalance_is_rejected() {
        assert!(NodeCommand::parse("REBALANCE 1 f1 2 1001").is_err());
        assert!(NodeCommand::parse("REBALANCE 0").is_err());
    }
}
