//! Agent forwarding bridge
//!
//! Serves the SSH agent protocol over one forwarded agent channel against
//! the shared [`IdentityRegistry`]. Requests never see private keys leave
//! this process; only signatures do.
//!
//! The loop ends only on stream EOF or an I/O error. Every request-level
//! problem is answered with the failure record and the loop continues.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::keys;
use super::protocol::{sign_flags, take_record, AgentRequest, AgentResponse};
use super::registry::{AgentIdentity, IdentityRegistry};
use crate::ssh::CredentialSource;

const READ_CHUNK: usize = 8192;

/// Serves agent requests for one channel
pub struct AgentBridge {
    identities: Arc<IdentityRegistry>,
    prompts: Arc<dyn CredentialSource>,
    /// Every signature needs user approval ("confirm" forwarding mode)
    confirm_all: bool,
}

impl AgentBridge {
    pub fn new(
        identities: Arc<IdentityRegistry>,
        prompts: Arc<dyn CredentialSource>,
        confirm_all: bool,
    ) -> Self {
        Self {
            identities,
            prompts,
            confirm_all,
        }
    }

    /// Run until the channel closes, then best-effort close it
    pub async fn run<S>(&self, mut stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        info!("Agent forwarding channel opened");
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let mut chunk = vec![0u8; READ_CHUNK];

        'outer: loop {
            let n = match stream.read(&mut chunk).await {
                Ok(0) => {
                    debug!("Agent channel EOF");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!("Agent channel read failed: {}", e);
                    break;
                }
            };
            buf.extend_from_slice(&chunk[..n]);

            loop {
                let record = match take_record(&mut buf) {
                    Ok(Some(record)) => record,
                    Ok(None) => break,
                    Err(len) => {
                        warn!("Agent record of {} bytes exceeds limit, closing channel", len);
                        break 'outer;
                    }
                };

                let response = self.handle(&record).await;
                if let Err(e) = stream.write_all(&response.encode()).await {
                    warn!("Agent channel write failed: {}", e);
                    break 'outer;
                }
            }
        }

        let _ = stream.shutdown().await;
        info!("Agent forwarding channel closed");
    }

    /// Answer one record body (type byte plus payload)
    pub async fn handle(&self, record: &[u8]) -> AgentResponse {
        let request = match AgentRequest::decode(record) {
            Ok(request) => request,
            Err(e) => {
                debug!("Rejecting malformed agent request: {}", e);
                return AgentResponse::Failure;
            }
        };
        debug!("Agent request: {:?}", request);

        let locked = self.identities.is_locked();
        match request {
            AgentRequest::RequestIdentities => {
                AgentResponse::Identities(self.identities.public_identities())
            }
            AgentRequest::Unlock { passphrase } => {
                respond(self.identities.unlock(&passphrase))
            }
            _ if locked => AgentResponse::Failure,
            AgentRequest::SignRequest {
                key_blob,
                data,
                flags,
            } => self.sign(&key_blob, &data, flags).await,
            AgentRequest::AddIdentity { key, constraints } => {
                let comment = key.comment().to_string();
                let identity = AgentIdentity::new(key, comment)
                    .with_confirm(constraints.confirm)
                    .with_lifetime(
                        constraints
                            .lifetime_secs
                            .map(|secs| std::time::Duration::from_secs(secs.into())),
                    );
                self.identities.add(identity);
                AgentResponse::Success
            }
            AgentRequest::RemoveIdentity { key_blob } => {
                respond(self.identities.remove(&key_blob))
            }
            AgentRequest::RemoveAll => {
                self.identities.remove_all();
                AgentResponse::Success
            }
            AgentRequest::Lock { passphrase } => respond(self.identities.lock(&passphrase)),
            AgentRequest::Unsupported(kind) => {
                debug!("Unsupported agent request type {}", kind);
                AgentResponse::Failure
            }
        }
    }

    async fn sign(&self, key_blob: &[u8], data: &[u8], flags: u32) -> AgentResponse {
        if flags & !sign_flags::KNOWN != 0 {
            debug!("Sign request with unsupported flags {:#x}", flags);
            return AgentResponse::Failure;
        }

        let Some(identity) = self.identities.find(key_blob) else {
            debug!("Sign request for unknown key");
            return AgentResponse::Failure;
        };

        if self.confirm_all || identity.confirm {
            let message = format!("Allow remote host to use key '{}'?", identity.comment);
            if self.prompts.request_boolean(None, &message).await != Some(true) {
                info!("Use of agent key '{}' was not approved", identity.comment);
                return AgentResponse::Failure;
            }
        }

        match keys::sign(&identity.key, data, flags) {
            Ok(signature) => {
                debug!("Signed {} bytes with '{}'", data.len(), identity.comment);
                AgentResponse::Signature(signature)
            }
            Err(e) => {
                warn!("Agent signing with '{}' failed: {}", identity.comment, e);
                AgentResponse::Failure
            }
        }
    }
}

fn respond(ok: bool) -> AgentResponse {
    if ok {
        AgentResponse::Success
    } else {
        AgentResponse::Failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::keys::tests::encode_ed25519_identity;
    use crate::agent::protocol::{msg, put_string, WireReader, FAILURE_RECORD};
    use crate::ssh::keys::tests::test_key;
    use crate::testing::ScriptedPrompts;
    use bytes::BufMut;

    fn bridge(confirm_all: bool, prompts: ScriptedPrompts) -> (AgentBridge, Arc<IdentityRegistry>) {
        let registry = Arc::new(IdentityRegistry::new());
        (
            AgentBridge::new(registry.clone(), Arc::new(prompts), confirm_all),
            registry,
        )
    }

    fn sign_request(blob: &[u8], flags: u32) -> BytesMut {
        let mut body = BytesMut::new();
        body.put_u8(msg::SIGN_REQUEST);
        put_string(&mut body, blob);
        put_string(&mut body, b"session-id-and-stuff");
        body.put_u32(flags);
        body
    }

    fn with_type(kind: u8, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![kind];
        v.extend_from_slice(payload);
        v
    }

    #[tokio::test]
    async fn test_identities_empty_registry() {
        let (bridge, _) = bridge(false, ScriptedPrompts::default());
        assert_eq!(
            bridge.handle(&[msg::REQUEST_IDENTITIES]).await,
            AgentResponse::Identities(Vec::new())
        );
    }

    #[tokio::test]
    async fn test_locked_registry() {
        let (bridge, registry) = bridge(false, ScriptedPrompts::default());
        registry.add(AgentIdentity::new(test_key(1), "one"));
        let blob = keys::public_blob(&test_key(1));

        let mut lock = BytesMut::new();
        lock.put_u8(msg::LOCK);
        put_string(&mut lock, b"pw");
        assert_eq!(bridge.handle(&lock).await, AgentResponse::Success);
        // Locking twice fails
        assert_eq!(bridge.handle(&lock).await, AgentResponse::Failure);

        assert_eq!(
            bridge.handle(&[msg::REQUEST_IDENTITIES]).await,
            AgentResponse::Identities(Vec::new())
        );
        assert_eq!(bridge.handle(&sign_request(&blob, 0)).await, AgentResponse::Failure);
        assert_eq!(
            bridge.handle(&[msg::REMOVE_ALL_IDENTITIES]).await,
            AgentResponse::Failure
        );
        assert_eq!(registry.len(), 1);

        let mut unlock = BytesMut::new();
        unlock.put_u8(msg::UNLOCK);
        put_string(&mut unlock, b"pw");
        assert_eq!(bridge.handle(&unlock).await, AgentResponse::Success);
        assert!(matches!(
            bridge.handle(&sign_request(&blob, 0)).await,
            AgentResponse::Signature(_)
        ));
    }

    #[tokio::test]
    async fn test_sign_unknown_key_and_flags() {
        let (bridge, registry) = bridge(false, ScriptedPrompts::default());
        registry.add(AgentIdentity::new(test_key(1), "one"));
        let blob = keys::public_blob(&test_key(1));

        assert_eq!(
            bridge.handle(&sign_request(b"nope", 0)).await,
            AgentResponse::Failure
        );
        assert_eq!(
            bridge.handle(&sign_request(&blob, 0x100)).await,
            AgentResponse::Failure
        );

        match bridge.handle(&sign_request(&blob, 0)).await {
            AgentResponse::Signature(sig) => {
                let mut reader = WireReader::new(&sig);
                assert_eq!(reader.read_utf8().unwrap(), "ssh-ed25519");
            }
            other => panic!("expected signature, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_flags_rejected_before_confirmation() {
        let prompts = ScriptedPrompts::booleans([Some(true)]);
        let (bridge, registry) = bridge(true, prompts.clone());
        registry.add(AgentIdentity::new(test_key(1), "one"));
        let blob = keys::public_blob(&test_key(1));

        assert_eq!(
            bridge.handle(&sign_request(&blob, 0x100)).await,
            AgentResponse::Failure
        );
        assert!(prompts.asked().is_empty());
    }

    #[tokio::test]
    async fn test_confirm_mode_requires_yes() {
        let (bridge, registry) = bridge(true, ScriptedPrompts::booleans([Some(false), None, Some(true)]));
        registry.add(AgentIdentity::new(test_key(1), "one"));
        let blob = keys::public_blob(&test_key(1));

        assert_eq!(bridge.handle(&sign_request(&blob, 0)).await, AgentResponse::Failure);
        assert_eq!(bridge.handle(&sign_request(&blob, 0)).await, AgentResponse::Failure);
        assert!(matches!(
            bridge.handle(&sign_request(&blob, 0)).await,
            AgentResponse::Signature(_)
        ));
    }

    #[tokio::test]
    async fn test_per_identity_confirm() {
        let prompts = ScriptedPrompts::booleans([Some(false)]);
        let (bridge, registry) = bridge(false, prompts.clone());
        registry.add(AgentIdentity::new(test_key(1), "careful").with_confirm(true));
        registry.add(AgentIdentity::new(test_key(2), "relaxed"));

        assert_eq!(
            bridge
                .handle(&sign_request(&keys::public_blob(&test_key(1)), 0))
                .await,
            AgentResponse::Failure
        );
        assert!(matches!(
            bridge
                .handle(&sign_request(&keys::public_blob(&test_key(2)), 0))
                .await,
            AgentResponse::Signature(_)
        ));
        assert_eq!(prompts.asked().len(), 1);
        assert!(prompts.asked()[0].contains("careful"));
    }

    #[tokio::test]
    async fn test_add_constrained_and_remove() {
        let (bridge, registry) = bridge(false, ScriptedPrompts::default());

        let identity = encode_ed25519_identity(4, "added");
        let mut add = with_type(msg::ADD_ID_CONSTRAINED, &identity);
        add.extend_from_slice(&[2]); // confirm
        add.extend_from_slice(&[1, 0, 0, 0, 30]); // lifetime 30s
        assert_eq!(bridge.handle(&add).await, AgentResponse::Success);

        let added = registry.find_by_comment("added").unwrap();
        assert!(added.confirm);
        assert_eq!(added.lifetime, Some(std::time::Duration::from_secs(30)));

        let mut bad = with_type(msg::ADD_ID_CONSTRAINED, &identity);
        bad.push(42);
        assert_eq!(bridge.handle(&bad).await, AgentResponse::Failure);

        let mut remove = BytesMut::new();
        remove.put_u8(msg::REMOVE_IDENTITY);
        put_string(&mut remove, &keys::public_blob(&test_key(4)));
        assert_eq!(bridge.handle(&remove).await, AgentResponse::Success);
        assert_eq!(bridge.handle(&remove).await, AgentResponse::Failure);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_plain_add_ignores_trailing_constraints() {
        let (bridge, registry) = bridge(false, ScriptedPrompts::default());
        let mut add = with_type(msg::ADD_IDENTITY, &encode_ed25519_identity(6, "plain"));
        add.push(2);
        assert_eq!(bridge.handle(&add).await, AgentResponse::Success);
        assert!(!registry.find_by_comment("plain").unwrap().confirm);
    }

    #[tokio::test]
    async fn test_run_loop_over_stream() {
        let (bridge, registry) = bridge(false, ScriptedPrompts::default());
        registry.add(AgentIdentity::new(test_key(1), "one"));
        let (client, server) = tokio::io::duplex(1024);

        let task = tokio::spawn(async move { bridge.run(server).await });
        let (mut rd, mut wr) = tokio::io::split(client);

        // Request split across two writes, followed by garbage and an unknown type
        wr.write_all(&[0, 0, 0]).await.unwrap();
        wr.write_all(&[1, msg::REQUEST_IDENTITIES]).await.unwrap();
        wr.write_all(&[0, 0, 0, 1, 200]).await.unwrap();
        wr.write_all(&[0, 0, 0, 3, msg::SIGN_REQUEST, 0, 0]).await.unwrap();

        let mut header = [0u8; 4];
        rd.read_exact(&mut header).await.unwrap();
        let len = u32::from_be_bytes(header) as usize;
        let mut body = vec![0u8; len];
        rd.read_exact(&mut body).await.unwrap();
        assert_eq!(body[0], msg::IDENTITIES_ANSWER);
        assert_eq!(&body[1..5], &[0, 0, 0, 1]);

        let mut failure = [0u8; 5];
        rd.read_exact(&mut failure).await.unwrap();
        assert_eq!(failure, FAILURE_RECORD);
        rd.read_exact(&mut failure).await.unwrap();
        assert_eq!(failure, FAILURE_RECORD);

        drop(wr);
        drop(rd);
        task.await.unwrap();
    }
}
