pub mod messaging;
pub mod nak;
pub mod router;
pub mod test_util;
pub mod util;
