//! Application services: conversion, error mapping and notifications.

pub mod convert;
pub mod error;
pub mod notify;
