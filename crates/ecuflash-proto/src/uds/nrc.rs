//! Negative response codes seen on a flash session

use std::fmt;

use serde::Serialize;

/// Third byte of a `0x7F` negative response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegativeResponseCode {
    GeneralReject,
    ServiceNotSupported,
    SubFunctionNotSupported,
    IncorrectMessageLengthOrFormat,
    ConditionsNotCorrect,
    RequestSequenceError,
    RequestOutOfRange,
    SecurityAccessDenied,
    InvalidKey,
    ExceededNumberOfAttempts,
    RequiredTimeDelayNotExpired,
    UploadDownloadNotAccepted,
    TransferDataSuspended,
    GeneralProgrammingFailure,
    WrongBlockSequenceCounter,
    /// Not a failure: the ECU needs until P2* to answer
    ResponsePending,
    SubFunctionNotSupportedInActiveSession,
    ServiceNotSupportedInActiveSession,
    /// Any code not listed above, kept verbatim
    Unknown(u8),
}

use NegativeResponseCode as Nrc;

/// Wire value and log text for every named code
const CODES: &[(Nrc, u8, &str)] = &[
    (Nrc::GeneralReject, 0x10, "general reject"),
    (Nrc::ServiceNotSupported, 0x11, "service not supported"),
    (Nrc::SubFunctionNotSupported, 0x12, "sub-function not supported"),
    (Nrc::IncorrectMessageLengthOrFormat, 0x13, "incorrect message length or format"),
    (Nrc::ConditionsNotCorrect, 0x22, "conditions not correct"),
    (Nrc::RequestSequenceError, 0x24, "request sequence error"),
    (Nrc::RequestOutOfRange, 0x31, "request out of range"),
    (Nrc::SecurityAccessDenied, 0x33, "security access denied"),
    (Nrc::InvalidKey, 0x35, "invalid key"),
    (Nrc::ExceededNumberOfAttempts, 0x36, "exceeded number of attempts"),
    (Nrc::RequiredTimeDelayNotExpired, 0x37, "required time delay not expired"),
    (Nrc::UploadDownloadNotAccepted, 0x70, "upload/download not accepted"),
    (Nrc::TransferDataSuspended, 0x71, "transfer data suspended"),
    (Nrc::GeneralProgrammingFailure, 0x72, "general programming failure"),
    (Nrc::WrongBlockSequenceCounter, 0x73, "wrong block sequence counter"),
    (Nrc::ResponsePending, 0x78, "request correctly received, response pending"),
    (
        Nrc::SubFunctionNotSupportedInActiveSession,
        0x7E,
        "sub-function not supported in active session",
    ),
    (
        Nrc::ServiceNotSupportedInActiveSession,
        0x7F,
        "service not supported in active session",
    ),
];

impl NegativeResponseCode {
    fn entry(&self) -> Option<&'static (Nrc, u8, &'static str)> {
        CODES.iter().find(|(nrc, _, _)| nrc == self)
    }

    /// Human-readable text for tester logs
    pub fn description(&self) -> &'static str {
        self.entry().map_or("unknown code", |entry| entry.2)
    }
}

impl From<u8> for NegativeResponseCode {
    fn from(value: u8) -> Self {
        CODES
            .iter()
            .find(|(_, code, _)| *code == value)
            .map_or(Nrc::Unknown(value), |(nrc, _, _)| *nrc)
    }
}

impl From<NegativeResponseCode> for u8 {
    fn from(nrc: NegativeResponseCode) -> Self {
        match nrc {
            Nrc::Unknown(value) => value,
            named => named.entry().map_or(0, |entry| entry.1),
        }
    }
}

impl fmt::UpperHex for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::UpperHex::fmt(&u8::from(*self), f)
    }
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X} ({})", self, self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0x11, Nrc::ServiceNotSupported)]
    #[case(0x12, Nrc::SubFunctionNotSupported)]
    #[case(0x13, Nrc::IncorrectMessageLengthOrFormat)]
    #[case(0x24, Nrc::RequestSequenceError)]
    #[case(0x33, Nrc::SecurityAccessDenied)]
    #[case(0x35, Nrc::InvalidKey)]
    #[case(0x37, Nrc::RequiredTimeDelayNotExpired)]
    #[case(0x72, Nrc::GeneralProgrammingFailure)]
    #[case(0x78, Nrc::ResponsePending)]
    #[case(0x7F, Nrc::ServiceNotSupportedInActiveSession)]
    fn test_known_codes(#[case] code: u8, #[case] expected: Nrc) {
        assert_eq!(Nrc::from(code), expected);
        assert_eq!(u8::from(expected), code);
    }

    #[test]
    fn test_every_named_code_converts_both_ways() {
        for (nrc, code, _) in CODES {
            assert_eq!(Nrc::from(*code), *nrc);
            assert_eq!(u8::from(*nrc), *code);
        }
    }

    #[test]
    fn test_unknown_code_is_preserved() {
        let nrc = Nrc::from(0x99);
        assert_eq!(nrc, Nrc::Unknown(0x99));
        assert_eq!(u8::from(nrc), 0x99);
        assert_eq!(nrc.description(), "unknown code");
    }

    #[test]
    fn test_display() {
        assert_eq!(
            Nrc::RequiredTimeDelayNotExpired.to_string(),
            "0x37 (required time delay not expired)"
        );
    }
}
