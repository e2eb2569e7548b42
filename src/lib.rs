//! Streams a graph of ordinary and *asynchronous* values as newline-delimited
//! text frames, and reconstructs it incrementally on the other side.
//!
//! The synchronous part of a graph travels in a single *header frame*,
//! serialized by the [`codec`] module's structural flatten (shared
//! references, cycles, sentinel numerics like `-0` and `NaN`, dates,
//! arbitrary-precision integers, regular-expression literals, maps, sets,
//! and user-registered custom types). Asynchronous leaves — [`Promise`],
//! [`AsyncSequence`], [`PullStream`] — are replaced by numbered
//! placeholders; their chunks follow concurrently as *body frames*, one
//! producer substream per id, multiplexed over the same ordered text stream.
//!
//! ```text
//! [{"asyncIterable":1},["AsyncIterable",2],1]
//! [1,0,["hello"]]
//! [1,0,["world"]]
//! [1,2,["return value"]]
//! ```
//!
//! [`encode`] returns the frame stream; [`decode`] rebuilds the root value
//! immediately and hands back live asynchronous handles whose consumption
//! drives the remaining frames. Custom types round-trip through named
//! reducer/reviver pairs registered on [`EncodeOptions`] and
//! [`DecodeOptions`].
//!
//! Within one encoding session every distinct asynchronous value gets
//! exactly one id, and a value referenced from several positions revives as
//! one shared handle. Identity is *not* preserved across chunks: each body
//! frame is an independent serialization.

pub mod codec;
pub mod de;
pub mod en;
pub mod error;
pub mod framing;
pub mod resource;
pub mod signal;
pub mod value;

pub use codec::{Reducers, Revivers};
pub use de::{decode, decode_raw, DecodeOptions};
pub use en::{encode, EncodeOptions, EncodeStream};
pub use error::{CompositeError, DecodeError, EncodeError};
pub use value::{
    Array, AsyncSequence, Chunk, Map, Object, Opaque, Promise, PullStream, Regex, SeqStep,
    SequenceReader, Set, StreamReader, Value,
};
