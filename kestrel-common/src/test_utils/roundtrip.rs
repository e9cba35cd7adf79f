use std::{fmt::Debug, str::FromStr};

use proptest::{
    arbitrary::{any, Arbitrary},
    prop_assert_eq, proptest,
};
use serde::{de::DeserializeOwned, Serialize};

/// Quickly create a JSON string roundtrip proptest. This test is useful for
/// simple data types that map to/from a single base JSON type (string, int..)
///
/// ```ignore
/// json_string_roundtrip_proptest::<KsNetwork>();
/// ```
pub fn json_string_roundtrip_proptest<T>()
where
    T: Arbitrary + Debug + PartialEq + Serialize + DeserializeOwned,
{
    proptest!(|(value1: T)| {
        let json1 = serde_json::to_string(&value1).unwrap();
        let value2 = serde_json::from_str::<T>(&json1).unwrap();
        let json2 = serde_json::to_string(&value2).unwrap();
        prop_assert_eq!(&value1, &value2);
        // Serialized form should be canonical too
        prop_assert_eq!(&json1, &json2);
    });
}

/// Quickly create a `FromStr` / `Display` roundtrip proptest.
///
/// ```ignore
/// fromstr_display_roundtrip_proptest::<KsNetwork>();
/// ```
pub fn fromstr_display_roundtrip_proptest<T>()
where
    T: Arbitrary + Debug + PartialEq + FromStr + ToString,
    <T as FromStr>::Err: Debug,
{
    proptest!(|(value1: T)| {
        let string1 = value1.to_string();
        let value2 = T::from_str(&string1).unwrap();
        let string2 = value2.to_string();
        prop_assert_eq!(&value1, &value2);
        prop_assert_eq!(&string1, &string2);
    });
}
