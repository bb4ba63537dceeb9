//! Protobuf message bodies of the control plane.
//!
//! The message structs are hand-written prost derives; the wire encoding is
//! ordinary protobuf, so foreign implementations can interoperate from a
//! `.proto` transcription of these definitions.

/// First message a client sends; presents its public identity.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientRegistrationRequest {
    /// Human-readable key name, used as the identity handle after
    /// validation.
    #[prost(string, tag = "1")]
    pub public_key_name: String,

    /// Raw Ed25519 public key bytes.
    #[prost(bytes = "vec", tag = "2")]
    pub public_key: Vec<u8>,
}

/// Carries the challenge the client must sign to validate its connection.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientRegistrationResponse {
    /// Fresh random challenge bytes.
    #[prost(bytes = "vec", tag = "1")]
    pub challenge: Vec<u8>,
}

/// The client's signature over the registration challenge.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientValidationRequest {
    /// Detached signature over the challenge bytes.
    #[prost(bytes = "vec", tag = "1")]
    pub signature: Vec<u8>,
}

/// Outcome of challenge validation; carries the bootstrap contacts on
/// success.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClientValidationResponse {
    /// Whether the signature verified.
    #[prost(bool, tag = "1")]
    pub result: bool,

    /// Bootstrap endpoint addresses, index-aligned with the ports.
    #[prost(string, repeated, tag = "2")]
    pub bootstrap_endpoint_ip: Vec<String>,

    /// Bootstrap endpoint ports.
    #[prost(uint32, repeated, tag = "3")]
    pub bootstrap_endpoint_port: Vec<u32>,
}

/// Asks the Invigilator to launch a vault worker.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartVaultRequest {
    /// Account the vault belongs to.
    #[prost(string, tag = "1")]
    pub account_name: String,

    /// Serialized vault keys, delivered to the worker once it asks for its
    /// identity.
    #[prost(bytes = "vec", tag = "2")]
    pub keys: Vec<u8>,

    /// Random token proving the client holds the vault's secret key.
    #[prost(bytes = "vec", tag = "3")]
    pub token: Vec<u8>,

    /// Signature over the token with the vault key.
    #[prost(bytes = "vec", tag = "4")]
    pub token_signature: Vec<u8>,
}

/// Whether the worker was launched.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartVaultResponse {
    /// Launch outcome; the join confirmation arrives separately.
    #[prost(bool, tag = "1")]
    pub result: bool,
}

/// Asks the Invigilator to shut a vault down.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopVaultRequest {
    /// Client-supplied blob covered by the signature.
    #[prost(bytes = "vec", tag = "1")]
    pub data: Vec<u8>,

    /// Signature over `data` with the vault key.
    #[prost(bytes = "vec", tag = "2")]
    pub signature: Vec<u8>,

    /// Identity of the vault to stop.
    #[prost(string, tag = "3")]
    pub identity: String,
}

/// Outcome of a stop request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StopVaultResponse {
    /// Whether the vault was stopped.
    #[prost(bool, tag = "1")]
    pub result: bool,
}

/// Gets or sets the update-check interval.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateIntervalRequest {
    /// New interval in seconds; 0 reads the current value.
    #[prost(uint64, tag = "1")]
    pub new_update_interval: u64,
}

/// Current update-check interval.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateIntervalResponse {
    /// Interval in seconds; 0 signals failure.
    #[prost(uint64, tag = "1")]
    pub update_interval: u64,
}

/// A freshly spawned worker asking for its cryptographic identity.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VaultIdentityRequest {
    /// Process index the Invigilator assigned at spawn time.
    #[prost(uint32, tag = "1")]
    pub process_index: u32,

    /// Port the worker listens on for shutdown requests.
    #[prost(uint32, tag = "2")]
    pub listening_port: u32,
}

/// Identity delivered to a worker.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VaultIdentityResponse {
    /// Whether the process index matched a pending vault.
    #[prost(bool, tag = "1")]
    pub result: bool,

    /// Account the vault belongs to.
    #[prost(string, tag = "2")]
    pub account_name: String,

    /// Serialized vault keys.
    #[prost(bytes = "vec", tag = "3")]
    pub keys: Vec<u8>,

    /// Bootstrap endpoint addresses, index-aligned with the ports.
    #[prost(string, repeated, tag = "4")]
    pub bootstrap_endpoint_ip: Vec<String>,

    /// Bootstrap endpoint ports.
    #[prost(uint32, repeated, tag = "5")]
    pub bootstrap_endpoint_port: Vec<u32>,
}

/// A worker reporting whether it joined the network.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VaultJoinedNetwork {
    /// The vault's identity.
    #[prost(string, tag = "1")]
    pub identity: String,

    /// Whether the join succeeded.
    #[prost(bool, tag = "2")]
    pub joined: bool,
}

/// Acknowledges a join report.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VaultJoinedNetworkAck {
    /// Whether the report matched a supervised vault.
    #[prost(bool, tag = "1")]
    pub ack: bool,
}

/// Forwarded to the owning client once its vault reports in.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VaultJoinConfirmation {
    /// The vault's identity.
    #[prost(string, tag = "1")]
    pub identity: String,

    /// Whether the vault joined; `false` also signals a failed vault.
    #[prost(bool, tag = "2")]
    pub joined: bool,
}

/// Client acknowledgement of a join confirmation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VaultJoinConfirmationAck {
    /// Whether the confirmation matched a vault the client was waiting on.
    #[prost(bool, tag = "1")]
    pub ack: bool,
}

/// Asks a worker to shut down gracefully.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VaultShutdownRequest {}

/// Worker acknowledgement of a shutdown request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct VaultShutdownResponse {
    /// Whether the worker will stop.
    #[prost(bool, tag = "1")]
    pub acknowledged: bool,
}

/// Announces a downloaded release to connected clients.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NewVersionAvailable {
    /// Path of the new release on the local filesystem.
    #[prost(string, tag = "1")]
    pub new_version_filepath: String,
}

/// Client acknowledgement of a release announcement.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NewVersionAvailableAck {
    /// Echoes the path, or is empty when the client rejects the file.
    #[prost(string, tag = "1")]
    pub new_version_filepath: String,
}
