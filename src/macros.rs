//! Convenience macros for addresses and group telegrams.
//!
//! `ga!` and `ia!` build addresses from literal notation with the range
//! checks done at compile time. `knx_write!`, `knx_read!` and
//! `knx_respond!` queue a group telegram on a
//! [`KnxClient`](crate::client::KnxClient).

/// Creates a [`GroupAddress`](crate::addressing::GroupAddress) from 3-level notation.
///
/// ```text
/// ga!(main/middle/sub)
/// ```
///
/// - `main`: 0-31
/// - `middle`: 0-7
/// - `sub`: 0-255
///
/// # Examples
///
/// ```rust
/// use knx_engine::ga;
/// use knx_engine::addressing::GroupAddress;
///
/// let addr = ga!(1/2/3);
/// assert_eq!(addr, GroupAddress::new(1, 2, 3).unwrap());
/// ```
///
/// Out-of-range components do not compile:
///
/// ```compile_fail
/// let addr = knx_engine::ga!(32/0/0);
/// ```
///
/// ```compile_fail
/// let addr = knx_engine::ga!(1/8/0);
/// ```
#[macro_export]
macro_rules! ga {
    ($main:literal / $middle:literal / $sub:literal) => {{
        const _: () = {
            if $main > 31 {
                panic!("Main group must be 0-31");
            }
            if $middle > 7 {
                panic!("Middle group must be 0-7");
            }
            if $sub > 255 {
                panic!("Sub group must be 0-255");
            }
        };

        // MMMMMIII SSSSSSSS
        const RAW: u16 = (($main & 0x1F) << 11) | (($middle & 0x07) << 8) | ($sub & 0xFF);
        $crate::addressing::GroupAddress::from(RAW)
    }};
}

/// Creates an [`IndividualAddress`](crate::addressing::IndividualAddress) from
/// `area.line.device` notation.
///
/// Written with commas because `1.1.5` is not a valid token sequence:
///
/// ```rust
/// use knx_engine::ia;
/// use knx_engine::addressing::IndividualAddress;
///
/// assert_eq!(ia!(1, 1, 5), IndividualAddress::new(1, 1, 5).unwrap());
/// ```
///
/// ```compile_fail
/// let addr = knx_engine::ia!(16, 0, 1);
/// ```
#[macro_export]
macro_rules! ia {
    ($area:literal, $line:literal, $device:literal) => {{
        const _: () = {
            if $area > 15 {
                panic!("Area must be 0-15");
            }
            if $line > 15 {
                panic!("Line must be 0-15");
            }
            if $device > 255 {
                panic!("Device must be 0-255");
            }
        };

        // AAAALLLL DDDDDDDD
        const RAW: u16 = (($area & 0x0F) << 12) | (($line & 0x0F) << 8) | ($device & 0xFF);
        $crate::addressing::IndividualAddress::from(RAW)
    }};
}

/// Queue a `GroupValueWrite` with inline address notation.
///
/// ```rust,no_run
/// use knx_engine::knx_write;
/// use knx_engine::telegram::Payload;
/// # async fn run(client: knx_engine::client::KnxClient) -> knx_engine::Result<()> {
/// knx_write!(client, 1/2/3, Payload::Binary(1)).await?;
/// # Ok(())
/// # }
/// ```
///
/// Same as
/// `client.send(Telegram::group_write(ga!(1/2/3), Payload::Binary(1)))`.
#[macro_export]
macro_rules! knx_write {
    ($client:expr, $main:literal / $middle:literal / $sub:literal, $payload:expr) => {
        $client.send($crate::telegram::Telegram::group_write(
            $crate::ga!($main / $middle / $sub),
            $payload,
        ))
    };
}

/// Queue a `GroupValueRead`; the answer arrives on a subscription.
///
/// ```rust,no_run
/// use knx_engine::knx_read;
/// # async fn run(client: knx_engine::client::KnxClient) -> knx_engine::Result<()> {
/// let mut answers = client.subscribe(Some("1/2/10".parse()?));
/// knx_read!(client, 1/2/10).await?;
/// let response = answers.recv().await;
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! knx_read {
    ($client:expr, $main:literal / $middle:literal / $sub:literal) => {
        $client.send($crate::telegram::Telegram::group_read($crate::ga!(
            $main / $middle / $sub
        )))
    };
}

/// Queue a `GroupValueResponse` with inline address notation.
///
/// ```rust,no_run
/// use knx_engine::knx_respond;
/// use knx_engine::telegram::Payload;
/// # async fn run(client: knx_engine::client::KnxClient) -> knx_engine::Result<()> {
/// knx_respond!(client, 1/2/10, Payload::Array(vec![0x0C, 0x1A])).await?;
/// # Ok(())
/// # }
/// ```
#[macro_export]
macro_rules! knx_respond {
    ($client:expr, $main:literal / $middle:literal / $sub:literal, $payload:expr) => {
        $client.send($crate::telegram::Telegram::group_response(
            $crate::ga!($main / $middle / $sub),
            $payload,
        ))
    };
}

#[cfg(test)]
mod tests {
    use crate::addressing::{GroupAddress, IndividualAddress};
    use crate::telegram::{Apdu, Payload, Telegram};

    #[test]
    fn test_ga_macro_basic() {
        assert_eq!(ga!(1 / 2 / 3), GroupAddress::from(0x0A03));
    }

    #[test]
    fn test_ga_macro_various_addresses() {
        assert_eq!(ga!(0 / 0 / 1), GroupAddress::from(0x0001));
        assert_eq!(ga!(1 / 0 / 0), GroupAddress::from(0x0800));
        assert_eq!(ga!(5 / 3 / 100), GroupAddress::from(0x2B64));
        assert_eq!(ga!(31 / 7 / 255), GroupAddress::from(0xFFFF));
    }

    #[test]
    fn test_ia_macro() {
        assert_eq!(ia!(1, 1, 5), IndividualAddress::from(0x1105));
        assert_eq!(ia!(15, 15, 255), IndividualAddress::from(0xFFFF));
        assert_eq!(ia!(1, 1, 5), IndividualAddress::new(1, 1, 5).unwrap());
    }

    struct Recorder(std::cell::RefCell<Vec<Telegram>>);

    impl Recorder {
        fn send(&self, telegram: Telegram) -> usize {
            let mut sent = self.0.borrow_mut();
            sent.push(telegram);
            sent.len()
        }
    }

    #[test]
    fn test_telegram_macros_build_group_services() {
        let client = Recorder(std::cell::RefCell::new(Vec::new()));
        knx_write!(client, 1 / 2 / 3, Payload::Binary(1));
        knx_read!(client, 1 / 2 / 3);
        knx_respond!(client, 1 / 2 / 3, Payload::Array(vec![0x42]));

        let sent = client.0.into_inner();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|t| t.group_destination() == Some(ga!(1 / 2 / 3))));
        assert_eq!(sent[0], Telegram::group_write(ga!(1 / 2 / 3), Payload::Binary(1)));
        assert_eq!(sent[1].apdu, Some(Apdu::GroupValueRead));
        assert_eq!(
            sent[2],
            Telegram::group_response(ga!(1 / 2 / 3), Payload::Array(vec![0x42]))
        );
    }
}
