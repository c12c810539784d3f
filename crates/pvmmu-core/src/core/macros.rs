/// Defines a transparent numeric newtype used for frame numbers, addresses
/// and identifiers.
///
/// Arithmetic with the raw type keeps the newtype; the difference of two
/// values is the raw type. Values print in hex, identifiers in decimal.
macro_rules! newtype {
    ($(#[$meta:meta])* $name:ident($type:ty), $display:literal) => {
        $(#[$meta])*
        #[derive(
            Default,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            ::serde::Serialize,
            ::serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub $type);

        impl From<$type> for $name {
            fn from(value: $type) -> Self {
                Self(value)
            }
        }

        impl From<$name> for $type {
            fn from(value: $name) -> $type {
                value.0
            }
        }

        newtype!(@op $name, $type, Add, add, +);
        newtype!(@op $name, $type, Sub, sub, -);
        newtype!(@op $name, $type, BitAnd, bitand, &);
        newtype!(@op $name, $type, BitOr, bitor, |);

        impl ::std::ops::AddAssign<$type> for $name {
            fn add_assign(&mut self, rhs: $type) {
                self.0 += rhs;
            }
        }

        impl ::std::ops::Sub for $name {
            type Output = $type;

            fn sub(self, rhs: Self) -> $type {
                self.0 - rhs.0
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                write!(f, $display, self.0)
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                write!(f, concat!(stringify!($name), "(", $display, ")"), self.0)
            }
        }
    };

    (@op $name:ident, $type:ty, $trait:ident, $method:ident, $op:tt) => {
        impl ::std::ops::$trait<$type> for $name {
            type Output = Self;

            fn $method(self, rhs: $type) -> Self {
                Self(self.0 $op rhs)
            }
        }
    };
}

pub(crate) use newtype;
