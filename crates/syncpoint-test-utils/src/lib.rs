// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! Test utilities shared across the syncpoint crates.

use tempfile::TempDir;

/// Macro for creating parametrized tests.
///
/// Given a function `fn f(arg: T, ...)`, produces one `#[test]` per listed
/// case, grouped in a module named after the function:
///
/// ```
/// # use std::error::Error;
/// # use syncpoint_test_utils::param_test;
/// # fn main() {}
/// param_test! {
///     test_parses -> Result<(), Box<dyn Error>>: [
///         positive: ("21", 21),
///         negative: ("-17", -17),
///     ]
/// }
/// fn test_parses(to_parse: &str, expected: i32) -> Result<(), Box<dyn Error>> {
///     assert_eq!(expected, to_parse.parse::<i32>()?);
///     Ok(())
/// }
/// ```
#[macro_export]
macro_rules! param_test {
    ($func_name:ident -> $return_ty:ty: [
        $( $(#[$outer:meta])* $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        mod $func_name {
            use super::*;

            $(
                #[test]
                $(#[$outer])*
                fn $case_name() -> $return_ty {
                    $func_name($($args),*)
                }
            )*
        }
    };
    ($func_name:ident: [
        $( $(#[$outer:meta])* $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        $crate::param_test!(
            $func_name -> ():
            [ $( $(#[$outer])* $case_name: ( $($args),* ) ),+ ]
        );
    };
}

/// Macro for creating parametrized *asynchronous* tests.
///
/// Behaves like [`param_test`] but expands each case with the
/// `#[tokio::test]` attribute. An attribute placed before the function name
/// (for example `#[tokio::test(start_paused = true)]`) is applied to every
/// case instead of the default.
#[macro_export]
macro_rules! async_param_test {
    ($(#[$test_attr:meta])+ $func_name:ident -> $return_ty:ty: [
        $( $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        mod $func_name {
            use super::*;

            $crate::__async_param_test_case! {
                [$(#[$test_attr])+]
                $func_name -> $return_ty;
                $( $case_name: ( $($args),* ); )+
            }
        }
    };
    ($(#[$test_attr:meta])+ $func_name:ident: [
        $( $case_name:ident: ( $($args:expr),* $(,)? ) ),+$(,)?
    ]) => {
        $crate::async_param_test!(
            $(#[$test_attr])+ $func_name -> ():
            [ $( $case_name: ( $($args),* ) ),+ ]
        );
    };
}

/// Implementation detail of [`async_param_test`]: expands one test case at a
/// time, recursing over the remaining cases, so that the attribute tokens
/// (matched once as a `+` repetition) don't need to be zipped against a
/// second, differently-sized `case_name` repetition in the same macro arm.
#[doc(hidden)]
#[macro_export]
macro_rules! __async_param_test_case {
    ([$(#[$test_attr:meta])+] $func_name:ident -> $return_ty:ty; ) => {};
    ([$(#[$test_attr:meta])+] $func_name:ident -> $return_ty:ty;
        $case_name:ident: ( $($args:expr),* );
        $($rest:tt)*
    ) => {
        $(#[$test_attr])+
        async fn $case_name() -> $return_ty {
            $func_name($($args),*).await
        }

        $crate::__async_param_test_case! {
            [$(#[$test_attr])+]
            $func_name -> $return_ty;
            $($rest)*
        }
    };
}

/// A wrapper for a type along with a temporary directory on which it depends.
#[derive(Debug)]
pub struct WithTempDir<T> {
    /// The wrapped inner type.
    pub inner: T,
    /// The temporary directory that is kept alive.
    pub temp_dir: TempDir,
}

impl<T> WithTempDir<T> {
    /// Converts a `WithTempDir<T>` to a `WithTempDir<U>` by applying the
    /// provided function to the inner value, while maintaining the temporary
    /// directory.
    pub fn map<U, F>(self, f: F) -> WithTempDir<U>
    where
        F: FnOnce(T) -> U,
    {
        WithTempDir {
            inner: f(self.inner),
            temp_dir: self.temp_dir,
        }
    }

    /// Converts a `WithTempDir<T>` to a `WithTempDir<U>` by applying the
    /// provided fallible function to the inner value, while maintaining the
    /// temporary directory.
    pub fn and_then<U, F, E>(self, f: F) -> std::result::Result<WithTempDir<U>, E>
    where
        F: FnOnce(T) -> std::result::Result<U, E>,
    {
        Ok(WithTempDir {
            inner: f(self.inner)?,
            temp_dir: self.temp_dir,
        })
    }
}

/// Creates a [`WithTempDir`] by passing a fresh temporary directory to the
/// provided constructor.
pub fn with_temp_dir<T, F>(f: F) -> WithTempDir<T>
where
    F: FnOnce(&std::path::Path) -> T,
{
    let temp_dir = tempfile::tempdir().expect("able to create a temporary directory");
    WithTempDir {
        inner: f(temp_dir.path()),
        temp_dir,
    }
}
